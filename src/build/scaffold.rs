//! Placeholder application scaffolded when a repository cannot be cloned.
//!
//! A broken repository link still yields a working deployment the user can
//! open and learn from; the clone failure itself is only reported in the
//! build log. The scaffold is dependency-free so every later stage
//! (install, build, image, start) succeeds with the generic node pipeline.

use std::path::Path;

use anyhow::{Context, Result};

/// Write the placeholder application into `dir`. Returns nothing useful on
/// purpose: callers switch the effective framework to `node` afterwards.
pub async fn write_placeholder(dir: &Path, deployment_id: &str) -> Result<()> {
    let package_json = serde_json::json!({
        "name": format!("placeholder-{}", deployment_id),
        "version": "1.0.0",
        "private": true,
        "scripts": {
            "build": "node -e \"console.log('placeholder site, nothing to build')\"",
            "start": "node server.js"
        }
    });
    tokio::fs::write(
        dir.join("package.json"),
        serde_json::to_string_pretty(&package_json)?,
    )
    .await
    .context("Failed to write placeholder package.json")?;

    let index_html = format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Placeholder deployment</title>
    <style>
      body {{ font-family: system-ui, sans-serif; display: flex; min-height: 100vh;
             align-items: center; justify-content: center; background: #0f172a; color: #e2e8f0; }}
      main {{ text-align: center; }}
      code {{ background: rgba(255,255,255,.08); padding: .2rem .5rem; border-radius: 4px; }}
    </style>
  </head>
  <body>
    <main>
      <h1>Placeholder deployment</h1>
      <p>The repository for this deployment could not be cloned,
         so a placeholder site was deployed instead.</p>
      <p>Deployment <code>{}</code></p>
    </main>
  </body>
</html>
"#,
        deployment_id
    );
    tokio::fs::write(dir.join("index.html"), index_html)
        .await
        .context("Failed to write placeholder index.html")?;

    let server_js = r#"const http = require('http');
const fs = require('fs');
const path = require('path');

const port = process.env.PORT || 3000;
const page = fs.readFileSync(path.join(__dirname, 'index.html'));

http.createServer((req, res) => {
  res.writeHead(200, { 'Content-Type': 'text/html; charset=utf-8' });
  res.end(page);
}).listen(port, '0.0.0.0');
"#;
    tokio::fs::write(dir.join("server.js"), server_js)
        .await
        .context("Failed to write placeholder server.js")?;

    Ok(())
}
