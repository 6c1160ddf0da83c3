use serde_json::Value;
use uuid::Uuid;

use crate::{config::SandboxSettings, exchange::Exchange};

const CPU_PERIOD_MICROS: u64 = 100_000;
const LOG_MAX_SIZE: &str = "10m";
const LOG_MAX_FILE: &str = "3";
pub const LABEL_MANAGED: &str = "kx.managed";
pub const LABEL_EXCHANGE_ID: &str = "kx.exchange_id";
pub const LABEL_SLUG: &str = "kx.slug";
/// Where host directories of filesystem sources appear inside the sandbox.
pub const SANDBOX_DATA_DIR: &str = "/data";

/// A host directory exposed read-only inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
}

/// Everything needed to start one exchange's isolated server instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub memory_mb: u64,
    pub cpu_quota: u64,
    pub cpu_period: u64,
    pub pids_limit: u32,
    pub nofile_limit: u32,
    /// Passed through the runtime's process environment, never on argv.
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub mounts: Vec<BindMount>,
}

/// `kx-<slug>-<8 hex>`; the slug part is limited to container-name-safe
/// characters.
pub fn container_name(slug: &str) -> String {
    let safe: String = slug
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("kx-{safe}-{}", &suffix[..8])
}

/// Rewrites filesystem roots in `config` to paths under `target` and records
/// the bind mounts that make them exist there. Composite sources are walked
/// so each filesystem child gets its own mount.
fn relocate_filesystem_roots(
    backend: &str,
    config: &Value,
    target: &str,
    mounts: &mut Vec<BindMount>,
) -> Value {
    let mut config = config.clone();
    match backend {
        "filesystem" => {
            if let Some(root) = config.get("root_path").and_then(Value::as_str) {
                mounts.push(BindMount {
                    source: root.to_string(),
                    target: target.to_string(),
                });
                config["root_path"] = Value::String(target.to_string());
            }
        }
        "composite" => {
            if let Some(sources) = config.get_mut("sources").and_then(Value::as_array_mut) {
                for (index, source) in sources.iter_mut().enumerate() {
                    let child_backend = source
                        .get("backend")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let child_dir = source
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| index.to_string());
                    if let Some(child_config) = source.get("config") {
                        let relocated = relocate_filesystem_roots(
                            &child_backend,
                            child_config,
                            &format!("{target}/{child_dir}"),
                            mounts,
                        );
                        source["config"] = relocated;
                    }
                }
            }
        }
        _ => {}
    }
    config
}

impl SandboxSpec {
    pub fn for_exchange(
        exchange: &Exchange,
        port: u16,
        settings: &SandboxSettings,
        api_tokens_env: &str,
    ) -> Self {
        let cpu_quota = ((settings.cpu_fraction * CPU_PERIOD_MICROS as f64).round() as u64).max(1000);
        let mut mounts = Vec::new();
        let config =
            relocate_filesystem_roots(&exchange.backend, &exchange.config, SANDBOX_DATA_DIR, &mut mounts);

        Self {
            name: container_name(&exchange.slug),
            image: settings.image.clone(),
            port,
            memory_mb: settings.memory_mb,
            cpu_quota,
            cpu_period: CPU_PERIOD_MICROS,
            pids_limit: settings.pids_limit,
            nofile_limit: settings.nofile_limit,
            env: vec![
                ("EXCHANGE_SLUG".to_string(), exchange.slug.clone()),
                ("EXCHANGE_ID".to_string(), exchange.id.to_string()),
                ("EXCHANGE_BACKEND".to_string(), exchange.backend.clone()),
                ("EXCHANGE_CONFIG".to_string(), config.to_string()),
                (
                    "PUBLIC_BASE_URL".to_string(),
                    format!("http://{}:{port}", settings.host),
                ),
                ("BIND_ADDR".to_string(), "0.0.0.0".to_string()),
                ("BIND_PORT".to_string(), port.to_string()),
                ("MCP_API_TOKENS".to_string(), api_tokens_env.to_string()),
                ("RUST_LOG".to_string(), "info".to_string()),
            ],
            labels: vec![
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_EXCHANGE_ID.to_string(), exchange.id.to_string()),
                (LABEL_SLUG.to_string(), exchange.slug.clone()),
            ],
            mounts,
        }
    }

    /// Arguments for `docker run`, hardened: no capabilities beyond binding
    /// the port, read-only root, capped memory, CPU, pids and open files.
    pub fn docker_run_args(&self) -> Vec<String> {
        let memory = format!("{}m", self.memory_mb);
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            self.name.clone(),
            "--restart".into(),
            "no".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpu-period".into(),
            self.cpu_period.to_string(),
            "--cpu-quota".into(),
            self.cpu_quota.to_string(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--ulimit".into(),
            format!("nofile={0}:{0}", self.nofile_limit),
            "--cap-drop".into(),
            "ALL".into(),
            "--cap-add".into(),
            "NET_BIND_SERVICE".into(),
            "--security-opt".into(),
            "no-new-privileges:true".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,size=64m".into(),
            "--tmpfs".into(),
            "/var/run:rw,noexec,nosuid,size=1m".into(),
            "--log-driver".into(),
            "json-file".into(),
            "--log-opt".into(),
            format!("max-size={LOG_MAX_SIZE}"),
            "--log-opt".into(),
            format!("max-file={LOG_MAX_FILE}"),
            "--publish".into(),
            format!("127.0.0.1:{0}:{0}", self.port),
        ];

        for (key, value) in &self.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &self.mounts {
            args.push("--mount".into());
            args.push(format!(
                "type=bind,src={},dst={},readonly",
                mount.source, mount.target
            ));
        }
        // Values come from the docker client's environment; config may
        // carry backend credentials.
        for (key, _) in &self.env {
            args.push("--env".into());
            args.push(key.clone());
        }

        args.push(self.image.clone());
        args
    }
}
