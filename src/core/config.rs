use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::{PhiockerError, Result};

fn default_workdir() -> String {
    "/".to_string()
}

/// A single file-or-directory copy directive. `src` is relative to the spec
/// file's directory unless absolute; `dst` is relative to the container
/// rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySpec {
    pub src: String,
    pub dst: String,
}

/// Resource caps applied to the container's cgroup. All fields optional;
/// absent fields fall back to the defaults in [`crate::core::cgroup`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    #[serde(rename = "cpuQuota")]
    pub cpu_quota: Option<u64>,
    #[serde(rename = "cpuPeriod")]
    pub cpu_period: Option<u64>,
    pub memory: Option<u64>,
    pub pids: Option<u64>,
}

/// The declarative container document, parsed verbatim from the user's JSON
/// file. Unknown fields are accepted and ignored (serde's default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(rename = "baseImage")]
    pub base_image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub copy: Vec<CopySpec>,
    #[serde(default)]
    pub limits: Limits,
}

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

impl ContainerSpec {
    /// Parse a spec document. Strict on `name`/`baseImage`, lenient on the rest.
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| PhiockerError::user(format!("invalid container spec: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| PhiockerError::user(format!("failed to read spec '{}': {e}", path.display())))?;
        Self::parse(&data)
    }

    /// Structural + (when `launching`) launch-readiness validation.
    pub fn validate(&self, launching: bool) -> Result<()> {
        if self.name.is_empty() {
            return Err(PhiockerError::user("container name must not be empty"));
        }
        if !NAME_RE.is_match(&self.name) {
            return Err(PhiockerError::user(format!(
                "container name '{}' is not filesystem-safe",
                self.name
            )));
        }
        if self.base_image.is_empty() {
            return Err(PhiockerError::user("baseImage must not be empty"));
        }
        if launching && self.cmd.is_empty() {
            return Err(PhiockerError::user("cmd must not be empty to launch a container"));
        }
        if !self.workdir.starts_with('/') {
            return Err(PhiockerError::user("workdir must be an absolute path"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_spec() {
        let spec = ContainerSpec::parse(
            r#"{"name":"t1","baseImage":"alpine","cmd":["/bin/sh","-c","echo hi"]}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "t1");
        assert_eq!(spec.workdir, "/");
        assert!(spec.copy.is_empty());
        assert!(spec.validate(true).is_ok());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let spec = ContainerSpec::parse(
            r#"{"name":"t1","baseImage":"alpine","notAField":42}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "t1");
    }

    #[test]
    fn rejects_bad_name() {
        let spec = ContainerSpec {
            name: "../etc".into(),
            base_image: "alpine".into(),
            cmd: vec![],
            workdir: "/".into(),
            copy: vec![],
            limits: Limits::default(),
        };
        assert!(spec.validate(false).is_err());
    }

    #[test]
    fn empty_cmd_only_rejected_when_launching() {
        let spec = ContainerSpec {
            name: "t1".into(),
            base_image: "alpine".into(),
            cmd: vec![],
            workdir: "/".into(),
            copy: vec![],
            limits: Limits::default(),
        };
        assert!(spec.validate(false).is_ok());
        assert!(spec.validate(true).is_err());
    }

    #[test]
    fn copy_spec_round_trips() {
        let spec = ContainerSpec::parse(
            r#"{"name":"t1","baseImage":"alpine","copy":[{"src":"hello.txt","dst":"/root/hello.txt"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.copy.len(), 1);
        assert_eq!(spec.copy[0].dst, "/root/hello.txt");
    }
}
