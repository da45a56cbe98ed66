use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a deployment. A deployment only moves forward
/// through this machine, never backward; `can_transition` is the single
/// source of truth for legal moves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Ready,
    Failed,
    Stopped,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further pipeline writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped | Self::Cancelled)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Validate a deployment status transition. Repeated `building` writes are
/// legal (one per pipeline stage); everything else only moves forward.
pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;
    matches!(
        (from, to),
        (Pending, Building)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Building, Building)
            | (Building, Ready)
            | (Building, Failed)
            | (Ready, Stopped)
    )
}

/// Framework tag of a project. Drives default build commands, the
/// synthesized Dockerfile and the container's internal port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Next,
    React,
    Vue,
    Static,
    Node,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::React => "react",
            Self::Vue => "vue",
            Self::Static => "static",
            Self::Node => "node",
        }
    }

    /// Default build command when the project carries no override.
    pub fn default_build_command(&self) -> &'static str {
        match self {
            Self::Static => "npm run build --if-present",
            _ => "npm run build",
        }
    }

    /// Directory the build step writes its artifact to.
    pub fn default_output_dir(&self) -> &'static str {
        match self {
            Self::Next => ".next",
            Self::React => "build",
            Self::Vue => "dist",
            Self::Static => "dist",
            Self::Node => "dist",
        }
    }

    /// Frameworks whose artifact is plain files served by a static image.
    pub fn is_static(&self) -> bool {
        matches!(self, Self::React | Self::Vue | Self::Static)
    }

    /// Port the application listens on inside its container.
    pub fn container_port(&self) -> u16 {
        if self.is_static() { 80 } else { 3000 }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" | "nextjs" => Ok(Self::Next),
            "react" => Ok(Self::React),
            "vue" => Ok(Self::Vue),
            "static" => Ok(Self::Static),
            "node" => Ok(Self::Node),
            _ => Err(format!("Invalid framework: {}", s)),
        }
    }
}

/// Target class an environment variable applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvTarget {
    Development,
    Preview,
    Production,
}

impl EnvTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Preview => "preview",
            Self::Production => "production",
        }
    }
}

impl FromStr for EnvTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "preview" => Ok(Self::Preview),
            "production" => Ok(Self::Production),
            _ => Err(format!("Invalid env target: {}", s)),
        }
    }
}

/// Project configuration. Read-only input to the build pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub framework: Framework,
    pub production_branch: String,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_directory: Option<String>,
    pub node_version: Option<String>,
    pub auto_deploy: bool,
    pub created_at: String,
}

/// One build-and-run attempt for a project at a specific commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub status: DeploymentStatus,
    pub build_log: String,
    pub url: Option<String>,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
    pub is_preview: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    /// Env-target class this deployment selects variables for.
    pub fn env_target(&self) -> EnvTarget {
        if self.is_preview { EnvTarget::Preview } else { EnvTarget::Production }
    }
}

/// Key/value pair injected into build and container environments.
/// `value` is stored encrypted; see `secrets::EnvCipher`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
    pub id: i64,
    pub project_id: String,
    pub key: String,
    pub value: String,
    pub targets: Vec<EnvTarget>,
}

/// Convert a project name to a URL-safe hostname label.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        let mut end = max_len;
        while !slug.is_char_boundary(end) {
            end -= 1;
        }
        slug[..end].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["pending", "building", "ready", "failed", "stopped", "cancelled"] {
            let status: DeploymentStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("deploying".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_valid_transitions() {
        use DeploymentStatus::*;
        assert!(can_transition(Pending, Building));
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(Building, Building));
        assert!(can_transition(Building, Ready));
        assert!(can_transition(Building, Failed));
        assert!(can_transition(Ready, Stopped));
    }

    #[test]
    fn test_invalid_transitions_never_move_backward() {
        use DeploymentStatus::*;
        assert!(!can_transition(Ready, Building));
        assert!(!can_transition(Ready, Pending));
        assert!(!can_transition(Failed, Building));
        assert!(!can_transition(Failed, Ready));
        assert!(!can_transition(Stopped, Ready));
        assert!(!can_transition(Cancelled, Building));
        assert!(!can_transition(Building, Pending));
        assert!(!can_transition(Stopped, Building));
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Stopped.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(!DeploymentStatus::Ready.is_terminal());
        assert!(!DeploymentStatus::Building.is_terminal());
    }

    #[test]
    fn test_framework_defaults() {
        assert_eq!(Framework::Next.default_output_dir(), ".next");
        assert_eq!(Framework::React.default_output_dir(), "build");
        assert_eq!(Framework::Vue.default_output_dir(), "dist");
        assert!(Framework::React.is_static());
        assert!(!Framework::Next.is_static());
        assert_eq!(Framework::Next.container_port(), 3000);
        assert_eq!(Framework::Vue.container_port(), 80);
    }

    #[test]
    fn test_framework_parse_aliases() {
        assert_eq!("nextjs".parse::<Framework>().unwrap(), Framework::Next);
        assert!("rails".parse::<Framework>().is_err());
    }

    #[test]
    fn test_env_target_for_deployment() {
        let mut d = Deployment {
            id: "d1".into(),
            project_id: "p1".into(),
            status: DeploymentStatus::Pending,
            build_log: String::new(),
            url: None,
            branch: "main".into(),
            commit_sha: "latest".into(),
            commit_message: None,
            container_id: None,
            port: None,
            is_preview: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(d.env_target(), EnvTarget::Production);
        d.is_preview = true;
        assert_eq!(d.env_target(), EnvTarget::Preview);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Cool App", 40), "my-cool-app");
        assert_eq!(slugify("  hello--world!! ", 40), "hello-world");
        assert_eq!(slugify("averylongprojectname", 8), "averylon");
    }
}
