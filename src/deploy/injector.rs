//! Materializes operator-configured variables as PHP files the deployed
//! application loads, and wires them into its entry point.
//!
//! Files written into the workspace:
//!
//! | File               | When                         | Contents                               |
//! |--------------------|------------------------------|----------------------------------------|
//! | `custom-env.php`   | at least one variable exists | `$_ENV[...]` and `putenv(...)` per var |
//! | `auto-include.php` | always                       | loads the above, sets app context      |
//! | `index.php`        | missing or not yet wired     | requires `auto-include.php`            |
//! | `.htaccess`        | missing                      | front controller, denies generated files |
//!
//! Output is deterministic for a given input so repeated deployments produce
//! identical files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::models::{Application, CustomEnvVar};
use super::validate::is_valid_env_key;
use crate::errors::{DeployError, DeployResult};

pub const ENV_FILE: &str = "custom-env.php";
pub const BOOTSTRAP_FILE: &str = "auto-include.php";
pub const ENTRY_POINT: &str = "index.php";
pub const HTACCESS_FILE: &str = ".htaccess";

const BOOTSTRAP_REQUIRE: &str = "require_once __DIR__ . '/auto-include.php';";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointAction {
    /// Already references the bootstrap file.
    Unchanged,
    /// Existing entry point rewritten to require the bootstrap first.
    Rewritten,
    /// No entry point existed; a landing page was generated.
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionReport {
    pub variables_written: usize,
    /// Keys that are not valid identifiers and were left out.
    pub skipped_keys: Vec<String>,
    pub entry_point: EntryPointAction,
    pub htaccess_written: bool,
}

/// Quote `value` as a PHP single-quoted string literal.
pub fn php_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn write_file(path: PathBuf, content: &str) -> DeployResult<()> {
    std::fs::write(&path, content).map_err(|source| DeployError::InjectionFailed { path, source })
}

/// Render `custom-env.php`. Returns the file and the keys that were skipped.
pub fn render_env_file(variables: &[CustomEnvVar]) -> (String, Vec<String>) {
    let mut out = String::from(
        "<?php\n/**\n * Custom environment variables.\n * Generated on every deployment. Do not edit.\n */\n\n",
    );
    let mut skipped = Vec::new();
    for var in variables {
        if !is_valid_env_key(&var.key) {
            skipped.push(var.key.clone());
            continue;
        }
        if var.is_sensitive {
            let _ = writeln!(out, "// {} (sensitive)", var.key);
        } else {
            let _ = writeln!(out, "// {}", var.key);
        }
        let _ = writeln!(out, "$_ENV['{}'] = {};", var.key, php_quote(&var.value));
        let _ = writeln!(out, "putenv({});\n", php_quote(&format!("{}={}", var.key, var.value)));
    }
    (out, skipped)
}

pub fn render_bootstrap(app: &Application) -> String {
    let mut out = String::from(
        "<?php\n/**\n * Loads injected configuration and application context.\n * Generated on every deployment. Do not edit.\n */\n\n",
    );
    let _ = writeln!(out, "if (file_exists(__DIR__ . '/{}')) {{", ENV_FILE);
    let _ = writeln!(out, "    require_once __DIR__ . '/{}';", ENV_FILE);
    out.push_str("}\n\n");
    let id = app.id.to_string();
    for (key, value) in [
        ("APP_NAME", app.name.as_str()),
        ("APP_ID", id.as_str()),
        ("APP_DIRECTORY", app.directory.as_str()),
    ] {
        let _ = writeln!(out, "$_ENV['{}'] = {};", key, php_quote(value));
        let _ = writeln!(out, "putenv({});", php_quote(&format!("{}={}", key, value)));
    }
    out
}

/// Insert the bootstrap require into an existing entry point, or `None` when
/// it already references the bootstrap file.
pub fn wire_entry_point(content: &str) -> Option<String> {
    if content.contains(BOOTSTRAP_FILE) {
        return None;
    }
    let statement = format!("\n// Load injected environment\n{}\n", BOOTSTRAP_REQUIRE);
    let wired = match content.strip_prefix("<?php") {
        Some(rest) => format!("<?php{}{}", statement, rest),
        None => format!("<?php{}?>\n{}", statement, content),
    };
    Some(wired)
}

/// Landing page for a repository that ships no `index.php`.
pub fn render_landing_page(app: &Application) -> String {
    let mut out = format!("<?php\n{}\n\n", BOOTSTRAP_REQUIRE);
    let _ = writeln!(out, "$repository = {};", php_quote(&app.repository));
    let _ = writeln!(out, "$branch = {};", php_quote(&app.branch));
    let _ = writeln!(out, "$directory = {};", php_quote(&app.directory));
    let _ = writeln!(out, "$name = {};", php_quote(&app.name));
    out.push_str(
        r#"$hidden = ['.', '..', 'custom-env.php', 'auto-include.php', 'deployment.log'];
$files = array_values(array_diff(scandir(__DIR__), $hidden));
?>
<!DOCTYPE html>
<html>
<head><title><?= htmlspecialchars($name) ?></title></head>
<body>
<h1><?= htmlspecialchars($name) ?></h1>
<p>Deployed from <code><?= htmlspecialchars($repository) ?></code> (branch <code><?= htmlspecialchars($branch) ?></code>) into <code><?= htmlspecialchars($directory) ?></code>.</p>
<h2>Files</h2>
<ul>
<?php foreach ($files as $file): ?>
<li><?= htmlspecialchars($file) ?></li>
<?php endforeach; ?>
</ul>
</body>
</html>
"#,
    );
    out
}

pub fn render_htaccess() -> String {
    format!(
        "<FilesMatch \"^({}|{}|deployment\\.log)$\">\n    Require all denied\n</FilesMatch>\n\n\
         RewriteEngine On\n\
         RewriteCond %{{REQUEST_FILENAME}} !-f\n\
         RewriteCond %{{REQUEST_FILENAME}} !-d\n\
         RewriteRule ^(.*)$ index.php [QSA,L]\n",
        ENV_FILE.replace('.', "\\."),
        BOOTSTRAP_FILE.replace('.', "\\."),
    )
}

/// Write the generated files into `workspace` for `app` using a snapshot of
/// `variables`.
pub fn inject(
    workspace: &Path,
    variables: &[CustomEnvVar],
    app: &Application,
) -> DeployResult<InjectionReport> {
    let env_path = workspace.join(ENV_FILE);
    let (env_file, skipped_keys) = render_env_file(variables);
    let variables_written = variables.len() - skipped_keys.len();
    if variables_written > 0 {
        write_file(env_path, &env_file)?;
    } else if env_path.exists() {
        std::fs::remove_file(&env_path)
            .map_err(|source| DeployError::InjectionFailed { path: env_path, source })?;
    }

    write_file(workspace.join(BOOTSTRAP_FILE), &render_bootstrap(app))?;

    let entry = workspace.join(ENTRY_POINT);
    let entry_point = if entry.is_file() {
        let content =
            std::fs::read_to_string(&entry).map_err(|source| DeployError::InjectionFailed {
                path: entry.clone(),
                source,
            })?;
        match wire_entry_point(&content) {
            Some(wired) => {
                write_file(entry, &wired)?;
                EntryPointAction::Rewritten
            }
            None => EntryPointAction::Unchanged,
        }
    } else {
        write_file(entry, &render_landing_page(app))?;
        EntryPointAction::Generated
    };

    let htaccess = workspace.join(HTACCESS_FILE);
    let htaccess_written = !htaccess.exists();
    if htaccess_written {
        write_file(htaccess, &render_htaccess())?;
    }

    Ok(InjectionReport {
        variables_written,
        skipped_keys,
        entry_point,
        htaccess_written,
    })
}
