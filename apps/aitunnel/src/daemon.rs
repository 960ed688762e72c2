use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;

/// Pid and log files live here; the config defaults here too.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ai-tunnel")
}

fn pid_path() -> PathBuf {
    state_dir().join("aitunnel.pid")
}

fn log_path() -> PathBuf {
    state_dir().join("aitunnel.log")
}

const CONFIG_TEMPLATE: &str = r#"# aitunnel configuration
server:
  host: 127.0.0.1
  port: 9000
  ui:
    enabled: true
    host: 127.0.0.1
    port: 3000

# ssh:
#   host: vps.example.com
#   port: 22
#   username: tunnel
#   privateKeyPath: ~/.ssh/id_ed25519

channels:
  - name: openai
    target: https://api.openai.com
    keys:
      - sk-replace-me
    keyStrategy: round-robin
    weight: 10
    # tunnel:
    #   enabled: true
    #   localPort: 9000
    #   remotePort: 18080
    # healthCheck:
    #   path: /v1/models
    #   intervalMs: 30000
    #   timeoutMs: 5000

# routes:
#   - path: /v1/**
#     channels: [openai]
#     strategy: priority

settings:
  logLevel: info
  hotReload: false
  reconnectInterval: 5000
  retry:
    maxRetries: 3
    retryOn: [429, 502, 503, 504]
    backoff: exponential
    baseDelayMs: 300
    maxDelayMs: 10000

# uiAuthToken: change-me
"#;

pub fn init(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = aitunnel_common::config_path(config);
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create config directory")?;
    }
    fs::write(&path, CONFIG_TEMPLATE).context("write config template")?;
    println!("wrote starter config to {}", path.display());
    Ok(())
}

pub fn start(config: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(pid) = running_pid() {
        println!("already running (pid {pid})");
        return Ok(());
    }
    let config_path = aitunnel_common::config_path(config);
    anyhow::ensure!(
        config_path.exists(),
        "no config at {} (run `aitunnel init` first)",
        config_path.display()
    );

    fs::create_dir_all(state_dir()).context("create state directory")?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path())
        .context("open log file")?;
    let err_log = log.try_clone().context("clone log handle")?;

    let exe = std::env::current_exe().context("resolve current executable")?;
    let child = Command::new(exe)
        .arg("start")
        .arg("-f")
        .arg("--config")
        .arg(&config_path)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(err_log)
        .spawn()
        .context("spawn daemon process")?;

    fs::write(pid_path(), child.id().to_string()).context("write pid file")?;
    println!("started (pid {})", child.id());
    Ok(())
}

/// Exit code 1 when nothing is running, matching `status`.
pub fn stop() -> anyhow::Result<bool> {
    let Some(pid) = running_pid() else {
        println!("not running");
        return Ok(false);
    };
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All);
    if let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) {
        process.kill();
    }
    let _ = fs::remove_file(pid_path());
    println!("stopped (pid {pid})");
    Ok(true)
}

pub fn status() -> bool {
    match running_pid() {
        Some(pid) => {
            println!("running (pid {pid})");
            true
        }
        None => {
            println!("not running");
            false
        }
    }
}

pub fn logs(follow: bool) -> anyhow::Result<()> {
    let path = log_path();
    anyhow::ensure!(path.exists(), "no log file at {}", path.display());

    let mut file = fs::File::open(&path).context("open log file")?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).context("read log file")?;
    print!("{buf}");

    if !follow {
        return Ok(());
    }
    let mut offset = file.seek(SeekFrom::End(0))?;
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let len = fs::metadata(&path)?.len();
        if len < offset {
            // Rotated or truncated; start over.
            offset = 0;
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = String::new();
            file.read_to_string(&mut chunk)?;
            print!("{chunk}");
            offset = len;
        }
    }
}

fn running_pid() -> Option<u32> {
    let raw = fs::read_to_string(pid_path()).ok()?;
    let pid = raw.trim().parse::<u32>().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All);
    system
        .process(sysinfo::Pid::from_u32(pid))
        .is_some()
        .then_some(pid)
}
