#![allow(dead_code)]

use anyhow::Context as _;
use std::io::BufRead as _;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Minimal MCP server in POSIX `sh`: answers the handshake, lists one tool and echoes calls.
pub const SH_ECHO_BACKEND: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-echo","version":"1.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$id" ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      fi ;;
  esac
done
"#;

/// Kills the child on drop so a failing test never leaks a gateway.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub struct SpawnedGateway {
    pub child: KillOnDrop,
    pub base: String,
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // JSON logs end the address at the next quote.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

pub fn wait_for_listen_addr(mut child: Child, timeout: Duration) -> anyhow::Result<SpawnedGateway> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let start = Instant::now();
    let mut last_lines: Vec<String> = Vec::new();

    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!(
                "gateway exited early: {status}; output:\n{}",
                last_lines.join("\n")
            );
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if let Some(addr) = parse_listen_addr(&line, "Starting HTTP server on ") {
                    return Ok(SpawnedGateway {
                        child: KillOnDrop(child),
                        base: format!("http://{addr}"),
                    });
                }
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = child.kill();
    anyhow::bail!(
        "timed out waiting for listen address; last output:\n{}",
        last_lines.join("\n")
    );
}

/// Write the `sh` echo backend and a config that serves it as `echo`.
pub fn write_echo_config(dir: &Path) -> anyhow::Result<std::path::PathBuf> {
    let script = dir.join("echo.sh");
    std::fs::write(&script, SH_ECHO_BACKEND).context("write echo backend")?;

    let config_path = dir.join("gateway.yaml");
    let config = format!(
        r#"
gateway:
  bind: "127.0.0.1:0"
  callTimeout: 5
  startupTimeout: 10
servers:
  echo:
    type: process
    command: sh
    args: ["{}"]
"#,
        script.display()
    );
    std::fs::write(&config_path, config).context("write gateway config")?;
    Ok(config_path)
}

pub fn spawn_gateway(config_path: &Path) -> anyhow::Result<SpawnedGateway> {
    let bin = env!("CARGO_BIN_EXE_mcp-mux");
    let child = Command::new(bin)
        .arg("--config")
        .arg(config_path)
        .arg("--log-level")
        .arg("info")
        .env_remove("MCP_MUX_BIND")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn mcp-mux")?;
    wait_for_listen_addr(child, Duration::from_secs(15))
}
