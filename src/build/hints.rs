//! Remediation hints matched against failed build output.
//!
//! Build failures are terminal and never retried; the hints are appended
//! to the failure message so the user can fix the root cause before
//! re-triggering the deployment.

use std::sync::LazyLock;

use regex::Regex;

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)cannot find module '([^']+)'|module not found: (?:error: )?can't resolve '([^']+)'"#)
        .unwrap()
});

static MISSING_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)missing script:?\s+"?([a-z0-9:_-]+)"#).unwrap());

static TYPE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)error TS\d{3,5}:|^Type error:").unwrap());

static OUT_OF_MEMORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)javascript heap out of memory|reached heap limit").unwrap()
});

/// Derive remediation hints from captured build output.
pub fn remediation_hints(output: &str) -> Vec<String> {
    let mut hints = Vec::new();

    if let Some(caps) = MISSING_MODULE.captures(output) {
        let module = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("the missing module");
        hints.push(format!(
            "hint: '{}' could not be resolved; check it is listed in package.json dependencies (not only devDependencies)",
            module
        ));
    }

    if let Some(caps) = MISSING_SCRIPT.captures(output) {
        hints.push(format!(
            "hint: package.json has no '{}' script; set a build command override for this project",
            &caps[1]
        ));
    }

    if TYPE_ERROR.is_match(output) {
        hints.push(
            "hint: type checking failed; run the build locally to see the full type errors"
                .to_string(),
        );
    }

    if OUT_OF_MEMORY.is_match(output) {
        hints.push(
            "hint: the build ran out of memory; set NODE_OPTIONS=--max-old-space-size=4096 as a build-time environment variable"
                .to_string(),
        );
    }

    hints
}

/// Compose the terminal failure message for a failed build step.
pub fn failure_message(summary: &str, output: &str) -> String {
    let mut message = summary.to_string();
    let hints = remediation_hints(output);
    for hint in hints {
        message.push('\n');
        message.push_str(&hint);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_module_hint() {
        let output = "Error: Cannot find module 'left-pad'\n  at Function...";
        let hints = remediation_hints(output);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].contains("left-pad"));
    }

    #[test]
    fn test_webpack_missing_module_hint() {
        let output = "Module not found: Error: Can't resolve './missing' in '/app/src'";
        let hints = remediation_hints(output);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].contains("./missing"));
    }

    #[test]
    fn test_missing_script_hint() {
        let output = "npm ERR! Missing script: \"build\"";
        let hints = remediation_hints(output);
        assert!(hints[0].contains("'build' script"));
    }

    #[test]
    fn test_type_error_hint() {
        let output = "src/app.ts(3,5): error TS2322: Type 'string' is not assignable";
        assert!(remediation_hints(output)[0].contains("type checking"));

        let output = "Type error: Property 'foo' does not exist on type 'Bar'.";
        assert!(remediation_hints(output)[0].contains("type checking"));
    }

    #[test]
    fn test_out_of_memory_hint() {
        let output = "FATAL ERROR: Reached heap limit Allocation failed - JavaScript heap out of memory";
        assert!(remediation_hints(output)[0].contains("max-old-space-size"));
    }

    #[test]
    fn test_clean_output_yields_no_hints() {
        assert!(remediation_hints("webpack compiled successfully").is_empty());
    }

    #[test]
    fn test_failure_message_appends_hints() {
        let message = failure_message(
            "build failed: npm run build exited with code 1",
            "Cannot find module 'react'",
        );
        assert!(message.starts_with("build failed"));
        assert!(message.contains("hint: 'react'"));
    }
}
