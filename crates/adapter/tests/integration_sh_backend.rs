#![cfg(unix)]

mod common;

use anyhow::Context as _;
use common::{KillOnDrop, spawn_gateway, write_echo_config};
use serde_json::{Value, json};
use std::io::{BufRead as _, Write as _};
use std::process::{Command, Stdio};
use tempfile::tempdir;

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> anyhow::Result<(reqwest::StatusCode, Value)> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("POST")?;
    let status = resp.status();
    let body = resp.json().await.context("decode response")?;
    Ok((status, body))
}

#[tokio::test]
async fn forwards_tool_calls_to_a_real_process() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_echo_config(dir.path())?;
    let gw = spawn_gateway(&config)?;
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        &format!("{}/echo/mcp", gw.base),
        &json!({
            "jsonrpc": "2.0",
            "id": "client-7",
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}}
        }),
    )
    .await?;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["id"], "client-7");
    assert_eq!(body["result"]["content"][0]["text"], "echoed");

    // initialize is answered from the cached handshake.
    let (_, body) = post_json(
        &client,
        &format!("{}/echo/mcp", gw.base),
        &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await?;
    assert_eq!(body["result"]["serverInfo"]["name"], "sh-echo");

    Ok(())
}

#[tokio::test]
async fn aux_routes_report_backend_state() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_echo_config(dir.path())?;
    let gw = spawn_gateway(&config)?;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", gw.base)).send().await?;
    assert!(health.status().is_success());

    let backend_health: Value = client
        .get(format!("{}/echo/health", gw.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(backend_health["status"], "healthy");

    let tools: Value = client
        .get(format!("{}/tools", gw.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(tools["echo"][0]["name"], "echo");

    let (status, body) = post_json(
        &client,
        &format!("{}/nope/mcp", gw.base),
        &json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {}}),
    )
    .await?;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], -32001);

    Ok(())
}

#[test]
fn stdio_mode_bridges_stdin_to_the_backend() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = write_echo_config(dir.path())?;
    let child = Command::new(env!("CARGO_BIN_EXE_mcp-mux"))
        .arg("--config")
        .arg(&config)
        .arg("--stdio")
        .arg("echo")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn mcp-mux --stdio")?;
    let mut child = KillOnDrop(child);

    let mut stdin = child.0.stdin.take().context("missing stdin")?;
    let stdout = child.0.stdout.take().context("missing stdout")?;
    writeln!(
        stdin,
        r#"{{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{{"name":"echo","arguments":{{}}}}}}"#
    )?;
    stdin.flush()?;

    let mut line = String::new();
    std::io::BufReader::new(stdout).read_line(&mut line)?;
    let reply: Value = serde_json::from_str(&line).context("decode stdio reply")?;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["result"]["content"][0]["text"], "echoed");

    drop(stdin);
    let status = child.0.wait()?;
    assert!(status.success());
    Ok(())
}
