use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use rand::{Rng, distr::Alphanumeric};
use serde::Deserialize;

use crate::ktunnel::net;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps KTUNNEL_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("KTUNNEL_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("ktunnel.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["ktunnel.toml", "ktunnel.yaml", "ktunnel.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no ktunnel.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/ktunnel/ktunnel.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "ktunnel", "ktunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ktunnel.toml"))
    }
}

/// Writes the default exposed-host config to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path, &generate_secret())?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn generate_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn default_config_template_for_path(path: &Path, secret: &str) -> anyhow::Result<String> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let tmpl = match ext.as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    };
    Ok(tmpl.replace("{secret}", secret))
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub exposed_host: Option<String>,
    /// Comma separated.
    pub secrets: Option<String>,
}

pub fn load_config_with(path: &Path, overrides: &Overrides) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    let mut cfg = Config::from_file_config(fc);
    cfg.apply(overrides);
    cfg.validate()
        .with_context(|| format!("config: invalid {}", path.display()))?;
    Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
    /// Only warnings and errors unless `RUST_LOG` says otherwise.
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Empty on the exposed host itself.
    pub exposed_host: String,
    pub listen_addr: String,
    pub forward_addr: String,
    pub secrets: Vec<String>,
    pub target: String,
    pub max_tunnels: usize,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    tunnel: Option<FileTunnel>,

    tls: Option<FileTls>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
    #[serde(default)]
    quiet: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    exposed_host: Option<String>,
    listen_addr: Option<String>,
    forward_addr: Option<String>,
    #[serde(default)]
    secrets: Vec<String>,
    target: Option<String>,
    max_tunnels: Option<i64>,
    timeout_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    ping_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    cert_file: Option<String>,
    key_file: Option<String>,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
}

fn trimmed(s: Option<&String>, default: &str) -> String {
    match s.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|v| v.max(0) as u64).unwrap_or(default))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let lg = fc.logging.as_ref();
        let tn = fc.tunnel.as_ref();
        let tls = fc.tls.as_ref();

        Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: trimmed(lg.and_then(|l| l.level.as_ref()), "info"),
                format: trimmed(lg.and_then(|l| l.format.as_ref()), "text"),
                output: trimmed(lg.and_then(|l| l.output.as_ref()), "stderr"),
                add_source: lg.is_some_and(|l| l.add_source),
                quiet: lg.is_some_and(|l| l.quiet),
            },
            tunnel: TunnelConfig {
                exposed_host: trimmed(tn.and_then(|t| t.exposed_host.as_ref()), ""),
                listen_addr: trimmed(tn.and_then(|t| t.listen_addr.as_ref()), ":443"),
                forward_addr: trimmed(tn.and_then(|t| t.forward_addr.as_ref()), ""),
                secrets: tn
                    .map(|t| split_secrets(t.secrets.iter().map(String::as_str)))
                    .unwrap_or_default(),
                target: trimmed(tn.and_then(|t| t.target.as_ref()), ""),
                max_tunnels: tn
                    .and_then(|t| t.max_tunnels)
                    .unwrap_or(10)
                    .max(0) as usize,
                timeout: millis(tn.and_then(|t| t.timeout_ms), 30_000),
                connect_timeout: millis(tn.and_then(|t| t.connect_timeout_ms), 15_000),
                ping_interval: millis(tn.and_then(|t| t.ping_interval_ms), 60_000),
            },
            tls: TlsConfig {
                cert_file: trimmed(tls.and_then(|t| t.cert_file.as_ref()), ""),
                key_file: trimmed(tls.and_then(|t| t.key_file.as_ref()), ""),
                server_name: trimmed(tls.and_then(|t| t.server_name.as_ref()), ""),
                insecure_skip_verify: tls.is_some_and(|t| t.insecure_skip_verify),
                ca_file: trimmed(tls.and_then(|t| t.ca_file.as_ref()), ""),
            },
        }
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(host) = &overrides.exposed_host {
            self.tunnel.exposed_host = host.trim().to_string();
        }
        if let Some(secrets) = &overrides.secrets {
            self.tunnel.secrets = split_secrets([secrets.as_str()]);
        }
    }

    /// True when this process is the exposed host.
    pub fn is_exposed(&self) -> bool {
        self.tunnel.exposed_host.is_empty()
    }

    /// `host:port` of the exposed host's control port, as dialed by the protected host.
    pub fn exposed_addr(&self) -> String {
        let port = net::port_of(&self.tunnel.listen_addr).unwrap_or(443);
        net::with_default_port(&self.tunnel.exposed_host, port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.tunnel;
        if t.secrets.is_empty() {
            anyhow::bail!("need at least one (shared) secret");
        }
        if t.max_tunnels == 0 {
            anyhow::bail!("max_tunnels should be at least 1");
        }
        if net::port_of(&t.listen_addr).is_none_or(|p| p == 0) {
            anyhow::bail!("need a valid port in listen_addr {:?}", t.listen_addr);
        }

        if self.is_exposed() {
            if t.target.is_empty() {
                anyhow::bail!("exposed host needs a default target");
            }
            if net::split_host_port(&t.target).is_none_or(|(_, p)| p == 0) {
                anyhow::bail!("target {:?} needs an explicit port number", t.target);
            }
            if net::port_of(&t.forward_addr).is_none_or(|p| p == 0) {
                anyhow::bail!("exposed host needs a forward_addr being configured");
            }
        } else {
            if !self.tls.cert_file.is_empty() || !self.tls.key_file.is_empty() {
                anyhow::bail!("the protected host may not have a cert_file or key_file");
            }
            if !self.tls.insecure_skip_verify && self.tls.ca_file.is_empty() {
                anyhow::bail!("the protected host needs tls.ca_file or tls.insecure_skip_verify");
            }
        }
        Ok(())
    }
}

fn split_secrets<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        for s in item.split(',') {
            let s = s.trim();
            if !s.is_empty() && !out.iter().any(|o| o == s) {
                out.push(s.to_string());
            }
        }
    }
    out
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# ktunnel configuration (auto-generated)
#
# This file was created because ktunnel could not find a configuration file at the
# resolved config path. It configures the exposed host: protected hosts log in on
# listen_addr with one of the secrets, and every client connecting to forward_addr
# is tunneled to target on the protected side.
#
# To run a protected host instead, set tunnel.exposed_host to the exposed host's
# address and trust its certificate via tls.ca_file or tls.insecure_skip_verify.

# admin_addr = "127.0.0.1:9100"

[tunnel]
listen_addr = ":443"
forward_addr = ":8080"
target = "localhost:80"
secrets = ["{secret}"]
max_tunnels = 10
timeout_ms = 30000
connect_timeout_ms = 15000
ping_interval_ms = 60000

[tls]
# Leave both empty to generate an ephemeral self-signed certificate.
cert_file = ""
key_file = ""

[logging]
level = "info"
format = "text"
output = "stderr"
add_source = false
quiet = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# ktunnel configuration (auto-generated)
#
# This file was created because ktunnel could not find a configuration file at the
# resolved config path. It configures the exposed host: protected hosts log in on
# listen_addr with one of the secrets, and every client connecting to forward_addr
# is tunneled to target on the protected side.
#
# To run a protected host instead, set tunnel.exposed_host to the exposed host's
# address and trust its certificate via tls.ca_file or tls.insecure_skip_verify.

# admin_addr: "127.0.0.1:9100"

tunnel:
  listen_addr: ":443"
  forward_addr: ":8080"
  target: "localhost:80"
  secrets: ["{secret}"]
  max_tunnels: 10
  timeout_ms: 30000
  connect_timeout_ms: 15000
  ping_interval_ms: 60000

tls:
  # Leave both empty to generate an ephemeral self-signed certificate.
  cert_file: ""
  key_file: ""

logging:
  level: "info"
  format: "text"
  output: "stderr"
  add_source: false
  quiet: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn load_config(path: &Path) -> anyhow::Result<Config> {
        load_config_with(path, &Overrides::default())
    }

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "ktunnel_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn write_and_load(name: &str, file: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let cfg_path = dir.join(file);
        std::fs::write(&cfg_path, body).expect("write");
        let res = load_config(&cfg_path);
        let _ = std::fs::remove_dir_all(&dir);
        res
    }

    #[test]
    fn exposed_defaults() {
        let cfg = write_and_load(
            "exposed_defaults",
            "ktunnel.toml",
            r#"
[tunnel]
forward_addr = ":8080"
target = "intranet:80"
secrets = ["a, b", "b"]
"#,
        )
        .expect("load_config");

        assert!(cfg.is_exposed());
        assert_eq!(cfg.tunnel.listen_addr, ":443");
        assert_eq!(cfg.tunnel.secrets, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.tunnel.max_tunnels, 10);
        assert_eq!(cfg.tunnel.timeout, Duration::from_secs(30));
        assert_eq!(cfg.tunnel.connect_timeout, Duration::from_secs(15));
        assert_eq!(cfg.tunnel.ping_interval, Duration::from_secs(60));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.quiet);
    }

    #[test]
    fn exposed_target_needs_port() {
        let err = write_and_load(
            "target_port",
            "ktunnel.toml",
            r#"
[tunnel]
forward_addr = ":8080"
target = "intranet"
secrets = ["x"]
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("explicit port"));
    }

    #[test]
    fn secret_and_tunnel_limit_required() {
        let err = write_and_load(
            "no_secret",
            "ktunnel.toml",
            r#"
[tunnel]
forward_addr = ":8080"
target = "intranet:80"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("secret"));

        let err = write_and_load(
            "zero_tunnels",
            "ktunnel.toml",
            r#"
[tunnel]
forward_addr = ":8080"
target = "intranet:80"
secrets = ["x"]
max_tunnels = 0
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_tunnels"));
    }

    #[test]
    fn protected_host_yaml() {
        let cfg = write_and_load(
            "protected_yaml",
            "ktunnel.yaml",
            r#"
tunnel:
  exposed_host: "tunnel.example.com"
  listen_addr: ":8443"
  secrets: ["s3cret"]
tls:
  insecure_skip_verify: true
logging:
  quiet: true
"#,
        )
        .expect("load_config");

        assert!(!cfg.is_exposed());
        assert_eq!(cfg.exposed_addr(), "tunnel.example.com:8443");
        assert!(cfg.logging.quiet);
    }

    #[test]
    fn protected_host_may_not_carry_cert() {
        let err = write_and_load(
            "protected_cert",
            "ktunnel.toml",
            r#"
[tunnel]
exposed_host = "tunnel.example.com"
secrets = ["s3cret"]

[tls]
cert_file = "cert.pem"
insecure_skip_verify = true
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("may not have a cert_file"));
    }

    #[test]
    fn overrides_switch_role_and_secrets() {
        let dir = temp_dir("overrides");
        let cfg_path = dir.join("ktunnel.toml");
        std::fs::write(
            &cfg_path,
            r#"
[tunnel]
secrets = ["from-file"]

[tls]
insecure_skip_verify = true
"#,
        )
        .expect("write");

        let cfg = load_config_with(
            &cfg_path,
            &Overrides {
                exposed_host: Some("10.0.0.1:7443".into()),
                secrets: Some("one,two".into()),
            },
        )
        .expect("load_config_with");
        assert_eq!(cfg.exposed_addr(), "10.0.0.1:7443");
        assert_eq!(cfg.tunnel.secrets, vec!["one".to_string(), "two".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_unknown_fields() {
        let err = write_and_load(
            "unknown",
            "ktunnel.toml",
            r#"
[tunnel]
transport = "quic"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("transport"));
    }

    #[test]
    fn generated_template_is_a_valid_exposed_config() {
        for file in ["ktunnel.toml", "ktunnel.yml"] {
            let dir = temp_dir("template");
            let cfg_path = dir.join(file);

            assert!(ensure_config_file(&cfg_path).expect("ensure"));
            assert!(!ensure_config_file(&cfg_path).expect("ensure twice"));

            let cfg = load_config(&cfg_path).expect("load generated");
            assert!(cfg.is_exposed());
            assert_eq!(cfg.tunnel.secrets.len(), 1);
            assert_eq!(cfg.tunnel.secrets[0].len(), 32);
            assert_ne!(cfg.tunnel.secrets[0], "{secret}");

            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
