#![forbid(unsafe_code)]

//! Runtime configuration for MediaVault.
//!
//! Values come from explicit overrides (CLI flags), the process environment
//! and a `.env`-style file, in that order of precedence, with built-in
//! defaults for everything except the media directory.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "mediavault.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_OWNER: &str = "local";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub media_dir: PathBuf,
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub default_owner: String,
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    resolve_runtime_paths(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub default_owner: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_paths_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimePaths> {
    build_runtime_paths_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimePaths> {
    let media_dir = overrides
        .media_dir
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIAVAULT_MEDIA_DIR", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("MEDIAVAULT_MEDIA_DIR not set"))?;
    let database_path = overrides
        .database_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIAVAULT_DATABASE_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("MEDIAVAULT_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("MEDIAVAULT_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let default_owner = overrides
        .default_owner
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("MEDIAVAULT_DEFAULT_OWNER", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());
    Ok(RuntimePaths {
        media_dir: PathBuf::from(media_dir),
        database_path: PathBuf::from(database_path),
        host,
        port,
        default_owner,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimePaths {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_paths(&vars, |_| None).unwrap()
    }

    #[test]
    fn load_runtime_paths_reads_port() {
        let runtime = runtime_from("MEDIAVAULT_MEDIA_DIR=\"/media\"\nMEDIAVAULT_PORT=\"4242\"\n");
        assert_eq!(runtime.port, 4242);
    }

    #[test]
    fn load_runtime_paths_applies_defaults() {
        let runtime = runtime_from("MEDIAVAULT_MEDIA_DIR=\"/m\"\n");
        assert_eq!(runtime.media_dir, PathBuf::from("/m"));
        assert_eq!(runtime.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(runtime.default_owner, DEFAULT_OWNER);
    }

    #[test]
    fn load_runtime_paths_requires_media_dir() {
        let cfg = make_config("MEDIAVAULT_PORT=\"9090\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let err = build_runtime_paths(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("MEDIAVAULT_MEDIA_DIR"));
    }

    #[test]
    fn load_runtime_paths_reads_host_and_owner() {
        let runtime = runtime_from(
            "MEDIAVAULT_MEDIA_DIR=\"/m\"\nMEDIAVAULT_HOST=\"0.0.0.0\"\nMEDIAVAULT_DEFAULT_OWNER=\"alice\"\n",
        );
        assert_eq!(runtime.host, "0.0.0.0");
        assert_eq!(runtime.default_owner, "alice");
    }

    #[test]
    fn read_env_file_parses_values() {
        let cfg = make_config(
            "MEDIAVAULT_MEDIA_DIR=\"/x\"\nMEDIAVAULT_DATABASE_PATH=\"/y/cat.db\"\nMEDIAVAULT_PORT=\"9090\"\n",
        );
        let vars = read_env_file(cfg.path()).unwrap();
        let runtime = build_runtime_paths(&vars, |_| None).unwrap();
        assert_eq!(runtime.media_dir, PathBuf::from("/x"));
        assert_eq!(runtime.database_path, PathBuf::from("/y/cat.db"));
        assert_eq!(runtime.port, 9090);
    }

    #[test]
    fn build_runtime_paths_prefers_env_over_file() {
        let vars = read_env_file(make_config("MEDIAVAULT_MEDIA_DIR=\"/file\"\n").path()).unwrap();
        let runtime = build_runtime_paths(&vars, |key| {
            if key == "MEDIAVAULT_MEDIA_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(runtime.media_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MEDIAVAULT_MEDIA_DIR="/media"
            MEDIAVAULT_DATABASE_PATH='/db/cat.db'
            MEDIAVAULT_HOST =  "0.0.0.0"
            MEDIAVAULT_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MEDIAVAULT_MEDIA_DIR").unwrap(), "/media");
        assert_eq!(vars.get("MEDIAVAULT_DATABASE_PATH").unwrap(), "/db/cat.db");
        assert_eq!(vars.get("MEDIAVAULT_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("MEDIAVAULT_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn build_runtime_paths_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("MEDIAVAULT_MEDIA_DIR".to_string(), "/file-media".to_string());
        vars.insert("MEDIAVAULT_DATABASE_PATH".to_string(), "/file-db".to_string());
        vars.insert("MEDIAVAULT_HOST".to_string(), "file-host".to_string());
        vars.insert("MEDIAVAULT_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            media_dir: Some(PathBuf::from("/override-media")),
            database_path: None,
            port: Some(9000),
            host: Some("override-host".into()),
            default_owner: Some("carol".into()),
            env_path: None,
        };

        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |key| {
                if key == "MEDIAVAULT_DATABASE_PATH" {
                    Some("/env-db".to_string())
                } else if key == "MEDIAVAULT_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(runtime.media_dir, PathBuf::from("/override-media"));
        assert_eq!(runtime.database_path, PathBuf::from("/env-db"));
        assert_eq!(runtime.port, 9000);
        assert_eq!(runtime.host, "override-host");
        assert_eq!(runtime.default_owner, "carol");
    }

    #[test]
    fn build_runtime_paths_ignores_blank_host() {
        let vars = read_env_file(make_config("MEDIAVAULT_MEDIA_DIR=\"/m\"\n").path()).unwrap();
        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(runtime.host, DEFAULT_HOST);
    }

    #[test]
    fn build_runtime_paths_invalid_port_defaults() {
        let vars = read_env_file(
            make_config("MEDIAVAULT_MEDIA_DIR=\"/m\"\nMEDIAVAULT_PORT=\"nope\"\n").path(),
        )
        .unwrap();
        let runtime = build_runtime_paths(&vars, |_| None).unwrap();
        assert_eq!(runtime.port, DEFAULT_PORT);
    }
}
