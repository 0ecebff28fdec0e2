use crate::config::{Config, InstrInfo};

/// Delay bounds to generate for `target` under `instr`, in generation order.
///
/// Sources, highest priority first:
/// 1. several delays listed for the target in the override table,
/// 2. the target vector's own delay (or the instruction default),
/// 3. the instruction's per-target exception,
/// 4. a single delay listed in the override table,
/// 5. the instruction's default delay.
///
/// Zero is a valid delay. The result is never empty.
pub fn resolve_delay_bounds(target: &str, instr: &InstrInfo, config: &Config) -> Vec<u32> {
    let overrides = config.targets.get(target);

    if let Some(delays) = overrides.filter(|d| d.len() > 1) {
        return delays.clone();
    }

    if let Some(vector) = config.target_vectors.get(target) {
        return vec![vector.delay.unwrap_or(instr.delay_bound)];
    }

    if let Some(&delay) = instr.delay_exceptions.get(target) {
        return vec![delay];
    }

    if let Some(&delay) = overrides.and_then(|d| d.first()) {
        return vec![delay];
    }

    vec![instr.delay_bound]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use test_case::test_case;

    const CONFIG: &str = r#"
[targets]
r1 = [1, 3]
r2 = [5]
r3 = []
acc = [7]

[target_vectors.rf]
members = ["rf[0]"]
delay = 0

[target_vectors.rf_default]
members = ["rfd[0]"]
"#;

    fn instr() -> InstrInfo {
        InstrInfo {
            name: "ADD".to_string(),
            delay_bound: 2,
            delay_exceptions: BTreeMap::from([("acc".to_string(), 4), ("r1".to_string(), 9)]),
        }
    }

    #[test_case("plain", &[2]; "instruction default")]
    #[test_case("r1", &[1, 3]; "multiple overrides win over exceptions")]
    #[test_case("r2", &[5]; "single override")]
    #[test_case("r3", &[2]; "empty override list falls back")]
    #[test_case("acc", &[4]; "exception wins over single override")]
    #[test_case("rf", &[0]; "vector delay zero is explicit")]
    #[test_case("rf_default", &[2]; "vector without delay uses instruction default")]
    fn resolves(target: &str, expected: &[u32]) {
        let config: Config = CONFIG.parse().unwrap();
        assert_eq!(resolve_delay_bounds(target, &instr(), &config), expected);
    }

    #[test]
    fn never_empty() {
        let config: Config = "".parse().unwrap();
        let mut instr = instr();
        instr.delay_bound = 0;
        assert_eq!(resolve_delay_bounds("anything", &instr, &config), vec![0]);
    }
}
