use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "./gamewarden.toml";
const DEFAULT_DATA_ROOT: &str = "./data";
const DEFAULT_SHELL: &str = "/bin/zsh";
const DEFAULT_IDLE_SHUTDOWN_SECS: u64 = 60;
const DEFAULT_TERM_GRACE_SECS: u64 = 5;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Process-wide knobs, read once at boot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub data_root: PathBuf,
    pub shell: String,
    pub idle_shutdown: Duration,
    pub term_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            shell: DEFAULT_SHELL.to_string(),
            idle_shutdown: Duration::from_secs(DEFAULT_IDLE_SHUTDOWN_SECS),
            term_grace: Duration::from_secs(DEFAULT_TERM_GRACE_SECS),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_root = env_string("GAMEWARDEN_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);

        Self {
            config_path: env_string("GAMEWARDEN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            data_root: absolutize(data_root),
            shell: env_string("GAMEWARDEN_SHELL").unwrap_or(defaults.shell),
            idle_shutdown: Duration::from_secs(
                env_u64("GAMEWARDEN_IDLE_SHUTDOWN_SEC")
                    .map(|v| v.clamp(5, 24 * 60 * 60))
                    .unwrap_or(DEFAULT_IDLE_SHUTDOWN_SECS),
            ),
            term_grace: Duration::from_secs(
                env_u64("GAMEWARDEN_TERM_GRACE_SEC")
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(DEFAULT_TERM_GRACE_SECS),
            ),
        }
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.data_root.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Valheim,
    Minecraft,
    Generic,
}

impl GameKind {
    fn infer(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "valheim" => GameKind::Valheim,
            "minecraft" => GameKind::Minecraft,
            _ => GameKind::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub port: Option<u16>,
    pub address: Option<String>,
    /// Fixed session password. Valheim generates a fresh one per run when unset.
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GameDefinition {
    pub name: String,
    pub kind: GameKind,
    pub description: Option<String>,
    pub instances: Vec<InstanceConfig>,
}

impl GameDefinition {
    /// Exact match first, then case-insensitive.
    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        let name = name.trim();
        self.instances
            .iter()
            .find(|i| i.name == name)
            .or_else(|| {
                self.instances
                    .iter()
                    .find(|i| i.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn default_instance(&self) -> Option<&InstanceConfig> {
        self.instances.first()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    games: Vec<RawGame>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGame {
    name: String,
    kind: Option<GameKind>,
    description: Option<String>,
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInstance {
    name: String,
    command: Option<String>,
    script: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<String>,
    port: Option<u16>,
    address: Option<String>,
    password: Option<String>,
}

pub fn load(path: &Path, shell: &str) -> anyhow::Result<Vec<GameDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse(&raw, shell).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str, shell: &str) -> anyhow::Result<Vec<GameDefinition>> {
    let cfg: RawConfig = toml::from_str(raw).context("invalid toml")?;

    let mut seen_games = BTreeSet::new();
    let mut games = Vec::with_capacity(cfg.games.len());
    for g in cfg.games {
        let name = g.name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("game name must be non-empty");
        }
        if !seen_games.insert(name.to_ascii_lowercase()) {
            anyhow::bail!("duplicate game: {name}");
        }
        if g.instances.is_empty() {
            anyhow::bail!("game {name} has no instances");
        }

        let mut seen_instances = BTreeSet::new();
        let mut instances = Vec::with_capacity(g.instances.len());
        for i in g.instances {
            let inst = resolve_instance(i, shell)
                .with_context(|| format!("game {name}"))?;
            if !seen_instances.insert(inst.name.to_ascii_lowercase()) {
                anyhow::bail!("game {name}: duplicate instance: {}", inst.name);
            }
            instances.push(inst);
        }

        games.push(GameDefinition {
            kind: g.kind.unwrap_or_else(|| GameKind::infer(&name)),
            name,
            description: g.description.filter(|d| !d.trim().is_empty()),
            instances,
        });
    }

    Ok(games)
}

fn resolve_instance(raw: RawInstance, shell: &str) -> anyhow::Result<InstanceConfig> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        anyhow::bail!("instance name must be non-empty");
    }

    let cwd = raw
        .cwd
        .as_deref()
        .map(expand_env)
        .transpose()
        .with_context(|| format!("instance {name}: cwd"))?
        .map(PathBuf::from);

    let (command, args, cwd) = match (raw.command, raw.script) {
        (Some(_), Some(_)) => {
            anyhow::bail!("instance {name}: set either `command` or `script`, not both")
        }
        (None, None) => anyhow::bail!("instance {name}: `command` or `script` is required"),
        (Some(command), None) => {
            let command = expand_env(&command).with_context(|| format!("instance {name}"))?;
            (command, raw.args, cwd.unwrap_or_else(|| PathBuf::from(".")))
        }
        (None, Some(script)) => {
            // Scripts run through the shell from their own directory.
            let script = expand_env(&script).with_context(|| format!("instance {name}"))?;
            let script_dir = Path::new(&script)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let mut args = vec![script];
            args.extend(raw.args);
            (shell.to_string(), args, cwd.unwrap_or(script_dir))
        }
    };

    if command.trim().is_empty() {
        anyhow::bail!("instance {name}: command must be non-empty");
    }

    let password = raw
        .password
        .as_deref()
        .map(expand_env)
        .transpose()
        .with_context(|| format!("instance {name}: password"))?
        .filter(|p| !p.trim().is_empty());

    Ok(InstanceConfig {
        name,
        command,
        args,
        cwd,
        port: raw.port,
        address: raw.address.filter(|a| !a.trim().is_empty()),
        password,
    })
}

/// `$NAME` / `${NAME}` read the whole value from the environment; anything else is literal.
fn expand_env(value: &str) -> anyhow::Result<String> {
    let v = value.trim();
    let var = v
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .or_else(|| v.strip_prefix('$'));
    let Some(var) = var else {
        return Ok(value.to_string());
    };
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => anyhow::bail!("environment variable {var} is not set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[games]]
name = "Valheim"
description = "Co-op Viking survival."

[[games.instances]]
name = "Pantelimon"
script = "/srv/valheim/start_server.sh"

[[games]]
name = "minecraft"

[[games.instances]]
name = "Vanilla Fabric 1.21.5"
command = "java"
args = ["-jar", "server.jar", "nogui"]
cwd = "/srv/minecraft"
port = 25566

[[games.instances]]
name = "Modded"
command = "java"
password = "hunter2"
"#;

    #[test]
    fn parses_script_and_command_instances() {
        let games = parse(SAMPLE, "/bin/zsh").unwrap();
        assert_eq!(games.len(), 2);

        let valheim = &games[0];
        assert_eq!(valheim.kind, GameKind::Valheim);
        let inst = valheim.instance("pantelimon").unwrap();
        assert_eq!(inst.command, "/bin/zsh");
        assert_eq!(inst.args, vec!["/srv/valheim/start_server.sh".to_string()]);
        assert_eq!(inst.cwd, PathBuf::from("/srv/valheim"));

        let mc = &games[1];
        assert_eq!(mc.kind, GameKind::Minecraft);
        let inst = mc.default_instance().unwrap();
        assert_eq!(inst.command, "java");
        assert_eq!(inst.port, Some(25566));
        assert_eq!(inst.cwd, PathBuf::from("/srv/minecraft"));
        assert_eq!(inst.password, None);
        assert_eq!(mc.instance("modded").unwrap().password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn unknown_names_default_to_generic() {
        let raw = r#"
[[games]]
name = "terraria"
[[games.instances]]
name = "main"
command = "/bin/true"
"#;
        let games = parse(raw, "/bin/sh").unwrap();
        assert_eq!(games[0].kind, GameKind::Generic);
        assert_eq!(games[0].instances[0].cwd, PathBuf::from("."));
    }

    #[test]
    fn rejects_duplicate_games_and_missing_command() {
        let dup = r#"
[[games]]
name = "valheim"
[[games.instances]]
name = "a"
command = "/bin/true"
[[games]]
name = "Valheim"
[[games.instances]]
name = "b"
command = "/bin/true"
"#;
        let err = parse(dup, "/bin/sh").unwrap_err();
        assert!(format!("{err:#}").contains("duplicate game"));

        let missing = r#"
[[games]]
name = "valheim"
[[games.instances]]
name = "a"
"#;
        let err = parse(missing, "/bin/sh").unwrap_err();
        assert!(format!("{err:#}").contains("`command` or `script` is required"));
    }

    #[test]
    fn script_path_can_come_from_env() {
        // SAFETY: unique variable name, only read by this test.
        unsafe { std::env::set_var("GAMEWARDEN_TEST_SCRIPT_PATH", "/opt/game/run.sh") };
        let raw = r#"
[[games]]
name = "valheim"
[[games.instances]]
name = "a"
script = "${GAMEWARDEN_TEST_SCRIPT_PATH}"
"#;
        let games = parse(raw, "/bin/sh").unwrap();
        assert_eq!(games[0].instances[0].args[0], "/opt/game/run.sh");
        assert_eq!(games[0].instances[0].cwd, PathBuf::from("/opt/game"));
    }

    #[test]
    fn unset_env_reference_is_an_error() {
        let err = expand_env("$GAMEWARDEN_TEST_DEFINITELY_UNSET").unwrap_err();
        assert!(err.to_string().contains("GAMEWARDEN_TEST_DEFINITELY_UNSET"));
        assert_eq!(expand_env("/plain/path").unwrap(), "/plain/path");
    }

    #[test]
    fn password_env_reference_must_resolve() {
        let raw = r#"
[[games]]
name = "valheim"
[[games.instances]]
name = "Pantelimon"
command = "/bin/true"
password = "$GAMEWARDEN_TEST_UNSET_PASSWORD"
"#;
        let err = parse(raw, "/bin/sh").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("instance Pantelimon: password"), "{msg}");

        let blank = raw.replace("$GAMEWARDEN_TEST_UNSET_PASSWORD", "  ");
        let games = parse(&blank, "/bin/sh").unwrap();
        assert_eq!(games[0].instances[0].password, None);
    }
}
