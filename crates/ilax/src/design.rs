//! Structural queries about the hardware design.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::target::split_module_asv;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("cannot read design metadata `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed design metadata (toml): {0}")]
    Toml(#[from] toml::de::Error),

    #[error("malformed design metadata (json): {0}")]
    Json(#[from] serde_json::Error),

    #[error("top module `{0}` is not declared")]
    MissingTop(String),

    #[error("instance `{instance}` refers to undeclared module `{module}`")]
    UndeclaredModule { instance: String, module: String },
}

/// The design-metadata provider consumed by the engine.
///
/// `module` arguments name the scope a variable is declared in; `None`
/// means the top module.
pub trait DesignInfo: Send + Sync {
    fn top_module(&self) -> &str;

    fn module_outputs(&self) -> Vec<String>;

    fn is_fifo_output(&self, name: &str) -> bool;

    fn fifo_instances(&self) -> Vec<String>;

    fn module_of_instance(&self, instance: &str) -> Option<String>;

    fn is_module(&self, name: &str) -> bool;

    /// Declared width of `var` in `module`.
    fn var_width_simple(&self, var: &str, module: Option<&str>) -> Option<u32>;

    /// Effective width of a possibly qualified name (`var`, `module.var`,
    /// `instance.var`); differs from the declared width for aggregate storage.
    fn var_width_complex(&self, name: &str) -> Option<u32>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleDecl {
    /// Declared width of each variable.
    pub vars: BTreeMap<String, u32>,
    /// Effective widths where they differ from the declared ones.
    pub effective: BTreeMap<String, u32>,
}

/// File-backed [`DesignInfo`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesignMetadata {
    pub top: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub fifo_outputs: BTreeSet<String>,
    #[serde(default)]
    pub fifo_instances: Vec<String>,
    /// Instance name to module name.
    #[serde(default)]
    pub instances: BTreeMap<String, String>,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDecl>,
}

impl DesignMetadata {
    /// Loads JSON when the extension is `.json`, TOML otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DesignError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DesignError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let design: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => toml::from_str(&text)?,
        };
        design.validate()?;
        Ok(design)
    }

    pub fn from_toml(text: &str) -> Result<Self, DesignError> {
        let design: Self = toml::from_str(text)?;
        design.validate()?;
        Ok(design)
    }

    fn validate(&self) -> Result<(), DesignError> {
        if !self.modules.contains_key(&self.top) {
            return Err(DesignError::MissingTop(self.top.clone()));
        }
        for (instance, module) in &self.instances {
            if !self.modules.contains_key(module) {
                return Err(DesignError::UndeclaredModule {
                    instance: instance.clone(),
                    module: module.clone(),
                });
            }
        }
        Ok(())
    }

    fn scope(&self, module: Option<&str>) -> Option<&ModuleDecl> {
        self.modules.get(module.unwrap_or(&self.top))
    }
}

impl DesignInfo for DesignMetadata {
    fn top_module(&self) -> &str {
        &self.top
    }

    fn module_outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn is_fifo_output(&self, name: &str) -> bool {
        self.fifo_outputs.contains(name)
    }

    fn fifo_instances(&self) -> Vec<String> {
        self.fifo_instances.clone()
    }

    fn module_of_instance(&self, instance: &str) -> Option<String> {
        self.instances.get(instance).cloned()
    }

    fn is_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    fn var_width_simple(&self, var: &str, module: Option<&str>) -> Option<u32> {
        self.scope(module)?.vars.get(var).copied()
    }

    fn var_width_complex(&self, name: &str) -> Option<u32> {
        let (module, var) = match split_module_asv(name) {
            Some((prefix, var)) if self.is_module(prefix) => (Some(prefix.to_string()), var),
            Some((prefix, var)) => (Some(self.module_of_instance(prefix)?), var),
            None => (None, name),
        };
        let scope = self.scope(module.as_deref())?;
        scope
            .effective
            .get(var)
            .or_else(|| scope.vars.get(var))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESIGN: &str = r#"
top = "cpu"
outputs = ["acc", "pc", "q_out"]
fifo_outputs = ["q_out"]
fifo_instances = ["q0"]

[instances]
u_alu = "alu"
q0 = "fifo4"

[modules.cpu.vars]
acc = 8
pc = 32
q_out = 8
"mem[0]" = 16

[modules.cpu.effective]
"mem[0]" = 128

[modules.alu.vars]
flag = 1

[modules.fifo4.vars]
r0 = 8
r1 = 8
"#;

    #[test]
    fn widths_follow_qualification() {
        let design = DesignMetadata::from_toml(DESIGN).unwrap();
        assert_eq!(design.var_width_simple("acc", None), Some(8));
        assert_eq!(design.var_width_simple("flag", Some("alu")), Some(1));
        assert_eq!(design.var_width_complex("u_alu.flag"), Some(1));
        assert_eq!(design.var_width_complex("alu.flag"), Some(1));
        assert_eq!(design.var_width_complex("mem[0]"), Some(128));
        assert_eq!(design.var_width_complex("nobody.flag"), None);
        assert!(design.is_fifo_output("q_out"));
        assert_eq!(design.module_of_instance("q0").as_deref(), Some("fifo4"));
    }

    #[test]
    fn rejects_undeclared_instance_module() {
        let text = r#"
top = "cpu"
[instances]
u = "ghost"
[modules.cpu.vars]
a = 1
"#;
        assert!(matches!(
            DesignMetadata::from_toml(text),
            Err(DesignError::UndeclaredModule { .. })
        ));
    }
}
