use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{connection::client::BridgeInvocation, domain::ClientId, errors::Error, Result};

/// Bridge script run by `node` unless `BRIDGE_ARGS` says otherwise, relative to the
/// working directory.
const DEFAULT_BRIDGE_SCRIPT: &str = "bridge/index.js";

/// Credentials for the Supabase-backed session store.
#[derive(Clone, Debug)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

/// Typed configuration for the relay, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // HTTP
    pub port: u16,

    // Session persistence
    pub client_id: ClientId,
    pub session_dir: PathBuf,
    pub supabase: Option<SupabaseConfig>,

    // Bridge subprocess
    pub bridge_program: PathBuf,
    pub bridge_args: Vec<String>,
    pub bridge_working_dir: Option<PathBuf>,
    /// Deadline for the bridge to produce a pairing code or resume its session.
    pub startup_timeout: Duration,

    // Dispatch
    pub send_timeout: Duration,

    // Deployment
    pub production: bool,
    pub external_url: Option<String>,
    pub keep_alive_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let port = match env_str("PORT").and_then(non_empty) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("PORT must be a number, got `{raw}`")))?,
            None => 3000,
        };

        let client_id = ClientId(
            env_str("CLIENT_ID")
                .and_then(non_empty)
                .unwrap_or_else(|| "whatsapp-bot".to_string()),
        );
        let session_dir = env_path("SESSION_DIR").unwrap_or_else(|| PathBuf::from("./whatsapp-session"));

        // Both values are needed; a half-configured remote store falls back to local files.
        let supabase = match (
            env_str("SUPABASE_URL").and_then(non_empty),
            env_str("SUPABASE_ANON_KEY").and_then(non_empty),
        ) {
            (Some(url), Some(anon_key)) => Some(SupabaseConfig { url, anon_key }),
            _ => None,
        };

        let bridge_command = env_str("BRIDGE_COMMAND")
            .and_then(non_empty)
            .unwrap_or_else(|| "node".to_string());
        let bridge_program = resolve_program(&bridge_command);
        let bridge_args = parse_csv(env_str("BRIDGE_ARGS"))
            .unwrap_or_else(|| vec![DEFAULT_BRIDGE_SCRIPT.to_string()]);
        let bridge_working_dir = env_path("BRIDGE_WORKING_DIR");

        let startup_timeout =
            Duration::from_secs(env_u64("BRIDGE_STARTUP_TIMEOUT_SECS").unwrap_or(120).max(1));

        let send_timeout = Duration::from_millis(env_u64("SEND_TIMEOUT_MS").unwrap_or(60_000));

        let production = ["RELAY_ENV", "NODE_ENV"]
            .iter()
            .filter_map(|k| env_str(k))
            .any(|v| v.trim().eq_ignore_ascii_case("production"));
        let external_url = env_str("RENDER_EXTERNAL_URL").and_then(non_empty);
        let keep_alive_interval =
            Duration::from_secs(env_u64("KEEP_ALIVE_INTERVAL_SECS").unwrap_or(14 * 60).max(1));

        Ok(Self {
            port,
            client_id,
            session_dir,
            supabase,
            bridge_program,
            bridge_args,
            bridge_working_dir,
            startup_timeout,
            send_timeout,
            production,
            external_url,
            keep_alive_interval,
        })
    }

    /// How the bridge subprocess is launched. The client id is passed on so the bridge
    /// can key its browser profile by it.
    pub fn bridge_invocation(&self) -> BridgeInvocation {
        BridgeInvocation {
            program: self.bridge_program.clone(),
            args: self.bridge_args.clone(),
            cwd: self.bridge_working_dir.clone(),
            env: vec![("RELAY_CLIENT_ID".to_string(), self.client_id.0.clone())],
        }
    }

    /// Base URL to self-ping, only in production deployments that expose one.
    pub fn keep_alive_target(&self) -> Option<&str> {
        if !self.production {
            return None;
        }
        self.external_url.as_deref()
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Option<Vec<String>> {
    let v = v?;
    let out = v
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Bare program names are looked up on `PATH`; anything with a separator is used as-is.
fn resolve_program(command: &str) -> PathBuf {
    let candidate = PathBuf::from(command);
    if candidate.components().count() > 1 {
        return candidate;
    }
    which_in_path(command).unwrap_or(candidate)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bridge_script_ships_with_the_workspace() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        assert!(root.join(DEFAULT_BRIDGE_SCRIPT).is_file());
        assert!(root.join("bridge/package.json").is_file());
    }

    #[test]
    fn dotenv_skips_comments_and_strips_quotes() {
        let parsed = parse_dotenv(
            "# comment\n\nPORT=8080\nSUPABASE_URL=\"https://x.supabase.co\"\nBROKEN\n =nokey\nKEY='a=b'\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("PORT".to_string(), "8080".to_string()),
                ("SUPABASE_URL".to_string(), "https://x.supabase.co".to_string()),
                ("KEY".to_string(), "a=b".to_string()),
            ]
        );
    }

    #[test]
    fn csv_drops_blank_items() {
        assert_eq!(
            parse_csv(Some(" bridge/index.js , ,--headless".to_string())),
            Some(vec!["bridge/index.js".to_string(), "--headless".to_string()])
        );
        assert_eq!(parse_csv(Some(" , ".to_string())), None);
        assert_eq!(parse_csv(None), None);
    }

    #[test]
    fn explicit_program_paths_are_not_searched() {
        assert_eq!(
            resolve_program("./bin/bridge"),
            PathBuf::from("./bin/bridge")
        );
        assert_eq!(
            resolve_program("/opt/bridge/run"),
            PathBuf::from("/opt/bridge/run")
        );
    }

    #[test]
    fn keep_alive_requires_production_and_url() {
        let mut cfg = Config {
            port: 3000,
            client_id: ClientId("whatsapp-bot".to_string()),
            session_dir: PathBuf::from("/tmp/s"),
            supabase: None,
            bridge_program: PathBuf::from("node"),
            bridge_args: vec![],
            bridge_working_dir: None,
            startup_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            production: false,
            external_url: Some("https://relay.example.com".to_string()),
            keep_alive_interval: Duration::from_secs(60),
        };
        assert_eq!(cfg.keep_alive_target(), None);

        cfg.production = true;
        assert_eq!(cfg.keep_alive_target(), Some("https://relay.example.com"));

        cfg.external_url = None;
        assert_eq!(cfg.keep_alive_target(), None);

        let inv = cfg.bridge_invocation();
        assert_eq!(inv.program, PathBuf::from("node"));
        assert_eq!(
            inv.env,
            vec![("RELAY_CLIENT_ID".to_string(), "whatsapp-bot".to_string())]
        );
    }
}
