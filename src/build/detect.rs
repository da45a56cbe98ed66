//! Package manager detection from lockfile presence.

use std::path::Path;

/// Package manager chosen for the install stage. Detection precedence:
/// `pnpm-lock.yaml` > `yarn.lock` > `package-lock.json` > plain npm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    NpmLocked,
    Npm,
}

impl PackageManager {
    pub fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else if dir.join("yarn.lock").exists() {
            Self::Yarn
        } else if dir.join("package-lock.json").exists() {
            Self::NpmLocked
        } else {
            Self::Npm
        }
    }

    pub fn install_command(&self) -> &'static str {
        match self {
            Self::Pnpm => "pnpm install --frozen-lockfile",
            Self::Yarn => "yarn install --frozen-lockfile",
            Self::NpmLocked => "npm ci",
            Self::Npm => "npm install",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::NpmLocked | Self::Npm => "npm",
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
