//! Ensure a Next.js project builds with `output: 'standalone'`.
//!
//! The user's config file is never text-patched. When one exists it is
//! moved aside and a generated wrapper spreads it into a new config object
//! with the standalone override; otherwise a fresh config is written.

use std::path::Path;

use anyhow::{Context, Result};

const USER_CONFIG_JS: &str = "next.config.user.js";
const USER_CONFIG_MJS: &str = "next.config.user.mjs";

/// Make sure `next build` produces the standalone server bundle the
/// generated Dockerfile expects. Returns a short note for the build log.
pub async fn ensure_standalone_output(dir: &Path) -> Result<&'static str> {
    let config_js = dir.join("next.config.js");
    let config_mjs = dir.join("next.config.mjs");

    if config_js.exists() {
        tokio::fs::rename(&config_js, dir.join(USER_CONFIG_JS))
            .await
            .context("Failed to move next.config.js aside")?;
        let wrapper = format!(
            "const userConfig = require('./{USER_CONFIG_JS}');\n\n\
             module.exports = {{\n  ...userConfig,\n  output: 'standalone',\n}};\n"
        );
        tokio::fs::write(&config_js, wrapper)
            .await
            .context("Failed to write next.config.js wrapper")?;
        return Ok("wrapped next.config.js with standalone output");
    }

    if config_mjs.exists() {
        tokio::fs::rename(&config_mjs, dir.join(USER_CONFIG_MJS))
            .await
            .context("Failed to move next.config.mjs aside")?;
        let wrapper = format!(
            "import userConfig from './{USER_CONFIG_MJS}';\n\n\
             export default {{\n  ...userConfig,\n  output: 'standalone',\n}};\n"
        );
        tokio::fs::write(&config_mjs, wrapper)
            .await
            .context("Failed to write next.config.mjs wrapper")?;
        return Ok("wrapped next.config.mjs with standalone output");
    }

    let fresh = "/** @type {import('next').NextConfig} */\n\
                 module.exports = {\n  output: 'standalone',\n  reactStrictMode: true,\n};\n";
    tokio::fs::write(&config_js, fresh)
        .await
        .context("Failed to write next.config.js")?;
    Ok("generated next.config.js with standalone output")
}
