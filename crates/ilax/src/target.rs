use crate::config::Config;
use crate::design::DesignInfo;
use crate::error::ExtractError;

/// Escape marker for names that must be taken verbatim.
pub const ESCAPE_MARKER: char = '\\';
pub const QUALIFIER: char = '.';

/// Splits `prefix.var` into its module/instance prefix and variable.
///
/// Returns `None` for bare names and for escaped names, whose dots are part
/// of the identifier.
pub fn split_module_asv(name: &str) -> Option<(&str, &str)> {
    if name.starts_with(ESCAPE_MARKER) {
        return None;
    }
    name.split_once(QUALIFIER)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Turns a target name into something usable inside file and function names.
///
/// Names that lose characters on the way (`rf[0]`, `\a.b`) get a hash of
/// the original appended, so they cannot land on the same stem as a name
/// that was already clean (`rf_0_`). The hash is stable across runs.
pub fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim_start_matches(ESCAPE_MARKER);
    let clean: String = trimmed
        .chars()
        .map(|c| if is_ident_char(c) { c } else { '_' })
        .collect();
    if trimmed.len() == name.len() && trimmed.chars().all(is_ident_char) {
        clean
    } else {
        format!("{}_{:08x}", clean, fxhash::hash32(name))
    }
}

/// The resolved form of a generation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Target name as scheduled: an ASV name or a vector name.
    pub target: String,
    pub is_vector: bool,
    pub is_memory: bool,
    pub is_memory_vector: bool,
    pub module: Option<String>,
    pub instance: Option<String>,
    /// Unqualified variable name (the first member's, for vectors).
    pub var: String,
    pub width: u32,
    pub instr_name: String,
    /// Vector members in configured order; empty for scalar targets.
    pub members: Vec<String>,
}

impl TargetDescriptor {
    /// Name of the update function the generator emits for this target.
    pub fn func_name(&self) -> String {
        format!("{}_{}", sanitize_name(&self.instr_name), sanitize_name(&self.target))
    }
}

pub struct TargetClassifier<'a> {
    config: &'a Config,
    design: &'a dyn DesignInfo,
}

struct Scope {
    module: Option<String>,
    instance: Option<String>,
    var: String,
    width: u32,
}

impl<'a> TargetClassifier<'a> {
    pub fn new(config: &'a Config, design: &'a dyn DesignInfo) -> Self {
        Self { config, design }
    }

    pub fn classify(
        &self,
        target: &str,
        is_vector: bool,
        instr_name: &str,
    ) -> Result<TargetDescriptor, ExtractError> {
        if is_vector {
            self.classify_vector(target, instr_name)
        } else {
            let scope = self.resolve_scope(target)?;
            Ok(TargetDescriptor {
                target: target.to_string(),
                is_vector: false,
                is_memory: self.config.is_memory(target),
                is_memory_vector: false,
                module: scope.module,
                instance: scope.instance,
                var: scope.var,
                width: scope.width,
                instr_name: instr_name.to_string(),
                members: Vec::new(),
            })
        }
    }

    fn classify_vector(
        &self,
        target: &str,
        instr_name: &str,
    ) -> Result<TargetDescriptor, ExtractError> {
        let vector = self.config.target_vectors.get(target).ok_or_else(|| {
            ExtractError::UnknownTargetVector {
                name: target.to_string(),
            }
        })?;
        let first = vector
            .members
            .first()
            .ok_or_else(|| ExtractError::EmptyTargetVector {
                name: target.to_string(),
            })?;

        let mut scope = self.resolve_scope(first)?;
        if scope.module.is_none() {
            scope.module = Some(self.design.top_module().to_string());
        }
        Ok(TargetDescriptor {
            target: target.to_string(),
            is_vector: true,
            is_memory: false,
            is_memory_vector: self.config.is_memory(first),
            module: scope.module,
            instance: scope.instance,
            var: scope.var,
            width: scope.width,
            instr_name: instr_name.to_string(),
            members: vector.members.clone(),
        })
    }

    fn resolve_scope(&self, name: &str) -> Result<Scope, ExtractError> {
        let unknown = |name: &str| ExtractError::UnknownWidth {
            name: name.to_string(),
        };
        let Some((prefix, var)) = split_module_asv(name) else {
            let width = self
                .design
                .var_width_simple(name, None)
                .ok_or_else(|| unknown(name))?;
            return Ok(Scope {
                module: None,
                instance: None,
                var: name.to_string(),
                width,
            });
        };

        if self.design.is_module(prefix) {
            let width = self
                .design
                .var_width_simple(var, Some(prefix))
                .ok_or_else(|| unknown(name))?;
            return Ok(Scope {
                module: Some(prefix.to_string()),
                instance: None,
                var: var.to_string(),
                width,
            });
        }

        let module = self.design.module_of_instance(prefix).ok_or_else(|| {
            ExtractError::UnresolvedInstance {
                instance: prefix.to_string(),
            }
        })?;
        let width = self
            .design
            .var_width_simple(var, Some(&module))
            .ok_or_else(|| unknown(name))?;
        Ok(Scope {
            module: Some(module),
            instance: Some(prefix.to_string()),
            var: var.to_string(),
            width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::DesignMetadata;

    const DESIGN: &str = r#"
top = "cpu"
[instances]
u_alu = "alu"
[modules.cpu.vars]
acc = 8
"rf[0]" = 32
"rf[1]" = 32
"mem[2]" = 16
"\\odd.name" = 4
[modules.alu.vars]
flag = 1
"#;

    const CONFIG: &str = r#"
[target_vectors.regfile]
members = ["rf[0]", "rf[1]"]
[target_vectors.alu_flags]
members = ["u_alu.flag"]
"#;

    fn fixtures() -> (Config, DesignMetadata) {
        (
            CONFIG.parse().unwrap(),
            DesignMetadata::from_toml(DESIGN).unwrap(),
        )
    }

    #[test]
    fn bare_and_escaped_names() {
        let (config, design) = fixtures();
        let classifier = TargetClassifier::new(&config, &design);
        let acc = classifier.classify("acc", false, "ADD").unwrap();
        assert_eq!(acc.width, 8);
        assert_eq!(acc.module, None);
        assert_eq!(acc.func_name(), "ADD_acc");

        let odd = classifier.classify("\\odd.name", false, "ADD").unwrap();
        assert_eq!(odd.width, 4);
        assert_eq!(odd.var, "\\odd.name");
    }

    #[test]
    fn lossy_names_do_not_collide() {
        assert_eq!(sanitize_name("rf_0_"), "rf_0_");
        assert_eq!(sanitize_name("ADD"), "ADD");
        let bracketed = sanitize_name("rf[0]");
        assert_ne!(bracketed, "rf_0_");
        assert!(bracketed.starts_with("rf_0__"));
        assert_eq!(bracketed, sanitize_name("rf[0]"));
        assert_ne!(sanitize_name("rf.0_"), bracketed);
        assert_ne!(sanitize_name("\\acc"), "acc");
    }

    #[test]
    fn module_and_instance_prefixes() {
        let (config, design) = fixtures();
        let classifier = TargetClassifier::new(&config, &design);
        let by_module = classifier.classify("alu.flag", false, "ADD").unwrap();
        assert_eq!(by_module.module.as_deref(), Some("alu"));
        assert_eq!(by_module.instance, None);

        let by_instance = classifier.classify("u_alu.flag", false, "ADD").unwrap();
        assert_eq!(by_instance.module.as_deref(), Some("alu"));
        assert_eq!(by_instance.instance.as_deref(), Some("u_alu"));
        assert_eq!(by_instance.var, "flag");

        let err = classifier.classify("u_nope.flag", false, "ADD").unwrap_err();
        assert!(matches!(err, ExtractError::UnresolvedInstance { instance } if instance == "u_nope"));
    }

    #[test]
    fn memory_flag() {
        let (config, design) = fixtures();
        let classifier = TargetClassifier::new(&config, &design);
        assert!(classifier.classify("mem[2]", false, "ADD").unwrap().is_memory);
        assert!(!classifier.classify("acc", false, "ADD").unwrap().is_memory);
    }

    #[test]
    fn vectors_default_to_top_module() {
        let (config, design) = fixtures();
        let classifier = TargetClassifier::new(&config, &design);
        let rf = classifier.classify("regfile", true, "ADD").unwrap();
        assert!(rf.is_vector);
        assert_eq!(rf.module.as_deref(), Some("cpu"));
        assert_eq!(rf.members, vec!["rf[0]", "rf[1]"]);
        assert_eq!(rf.width, 32);

        let flags = classifier.classify("alu_flags", true, "ADD").unwrap();
        assert_eq!(flags.module.as_deref(), Some("alu"));
        assert_eq!(flags.instance.as_deref(), Some("u_alu"));
    }
}
