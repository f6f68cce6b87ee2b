//! Unix-domain socket control plane.
//!
//! Accepts newline-delimited JSON commands on `general.control_socket` and
//! replies with a newline-delimited JSON response, one request per line.
//! This is the machine-readable counterpart to the `SHOW ...` admin SQL
//! console: a small, scriptable surface for orchestration tooling (health
//! checks, failover scripts, config pushes) that would rather not speak the
//! PostgreSQL wire protocol.

use std::collections::HashMap;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::config::{get_config, reload_config, set_general_field, Config};
use crate::pool::retain::{flush_pool, FlushMode};
use crate::pool::{disable_pool, enable_pool, get_all_pools, ClientServerMap, ConnectionPool, PoolIdentifier};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    /// One-line summary: pool count, client/server counts, uptime.
    Status,
    /// Per-pool breakdown: address, pool mode, sizes, prepared statement cache stats.
    Details,
    Flush {
        #[serde(default = "default_flush_mode")]
        mode: String,
        database: String,
        user: String,
    },
    Enabledb {
        database: String,
        user: String,
    },
    Disabledb {
        database: String,
        user: String,
    },
    Switch {
        database: String,
        user: String,
        server_host: String,
        server_port: u16,
    },
    Conf {
        #[serde(rename = "op")]
        op: ConfOp,
        key: Option<String>,
        value: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        immediate: bool,
    },
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConfOp {
    Reload,
    Get,
    Set,
}

fn default_flush_mode() -> String {
    "idle".to_string()
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl Response {
    fn ok() -> Response {
        Response {
            ok: true,
            message: None,
            data: None,
        }
    }

    fn ok_with(data: serde_json::Value) -> Response {
        Response {
            ok: true,
            message: None,
            data: Some(data),
        }
    }

    fn err(message: impl Into<String>) -> Response {
        Response {
            ok: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Binds the control socket and serves commands until the process exits.
/// Errors binding the socket are logged and fatal only to this task — the
/// proxy keeps serving client traffic even if the control plane can't start.
pub async fn serve(client_server_map: ClientServerMap) {
    let path = get_config().general.control_socket;
    if path.is_empty() {
        info!("Control socket disabled (general.control_socket is empty)");
        return;
    }

    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind control socket at {path}: {err}");
            return;
        }
    };
    info!("Control socket listening at {path}");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Failed to accept control connection: {err}");
                continue;
            }
        };
        let client_server_map = client_server_map.clone();
        tokio::task::spawn(async move {
            if let Err(err) = handle_connection(stream, client_server_map).await {
                warn!("Control connection error: {err}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    client_server_map: ClientServerMap,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => dispatch(command, client_server_map.clone()).await,
            Err(err) => Response::err(format!("invalid command: {err}")),
        };

        let mut payload = serde_json::to_vec(&response).unwrap_or_default();
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;
    }

    Ok(())
}

async fn dispatch(command: Command, client_server_map: ClientServerMap) -> Response {
    match command {
        Command::Ping => Response::ok_with(serde_json::json!("pong")),

        Command::Status => {
            let pools = get_all_pools();
            let mut clients = 0i64;
            let mut servers = 0i64;
            for (_, pool) in pools.iter() {
                let state = pool.pool_state();
                clients += state.waiting as i64;
                servers += state.size as i64;
            }
            Response::ok_with(serde_json::json!({
                "pools": pools.len(),
                "clients_waiting": clients,
                "server_connections": servers,
            }))
        }

        Command::Details => {
            let pools = get_all_pools();
            let details: Vec<serde_json::Value> = pools
                .iter()
                .map(|(id, pool)| pool_details(id, pool))
                .collect();
            Response::ok_with(serde_json::json!(details))
        }

        Command::Flush {
            mode,
            database,
            user,
        } => {
            let mode = match mode.as_str() {
                "idle" => FlushMode::Idle,
                "graceful" => FlushMode::Graceful,
                "all" => FlushMode::All,
                other => return Response::err(format!("unknown flush mode: {other}")),
            };
            let id = PoolIdentifier::new(&database, &user);
            if flush_pool(&id, mode) {
                Response::ok()
            } else {
                Response::err(format!("no such pool: {user}@{database}"))
            }
        }

        Command::Enabledb { database, user } => {
            let id = PoolIdentifier::new(&database, &user);
            if enable_pool(&id) || get_all_pools().contains_key(&id) {
                Response::ok()
            } else {
                Response::err(format!("no such pool: {user}@{database}"))
            }
        }

        Command::Disabledb { database, user } => {
            let id = PoolIdentifier::new(&database, &user);
            if disable_pool(&id) {
                Response::ok()
            } else {
                Response::err(format!("no such pool: {user}@{database}"))
            }
        }

        Command::Switch {
            database,
            user,
            server_host,
            server_port,
        } => switch_pool_backend(&database, &user, server_host, server_port, client_server_map).await,

        Command::Conf { op, key, value } => match op {
            ConfOp::Reload => match reload_config(client_server_map).await {
                Ok(changed) => Response::ok_with(serde_json::json!({ "changed": changed })),
                Err(err) => Response::err(err.to_string()),
            },
            ConfOp::Get => {
                let config = get_config();
                let flattened: HashMap<String, String> = (&config).into();
                match key {
                    Some(key) => match flattened.get(&key) {
                        Some(value) => Response::ok_with(serde_json::json!(value)),
                        None => Response::err(format!("unknown key: {key}")),
                    },
                    None => Response::ok_with(serde_json::json!(flattened)),
                }
            }
            ConfOp::Set => match (key, value) {
                (Some(key), Some(value)) => match set_general_field(&key, &value) {
                    Ok(()) => Response::ok(),
                    Err(err) => Response::err(err.to_string()),
                },
                _ => Response::err("conf set requires both key and value"),
            },
        },

        Command::Shutdown { immediate } => {
            info!("Shutdown requested via control socket (immediate: {immediate})");
            let signal = if immediate {
                nix::sys::signal::Signal::SIGTERM
            } else {
                nix::sys::signal::Signal::SIGINT
            };
            let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), signal);
            Response::ok()
        }
    }
}

fn pool_details(id: &PoolIdentifier, pool: &ConnectionPool) -> serde_json::Value {
    let state = pool.pool_state();
    let address = pool.address();
    let slots: HashMap<String, usize> = state
        .slot_counts()
        .into_iter()
        .map(|(slot_state, count)| (slot_state.to_string(), count))
        .collect();
    serde_json::json!({
        "database": id.db,
        "user": id.user,
        "pool_mode": pool.settings.pool_mode.to_string(),
        "server_host": address.host,
        "server_port": address.port,
        "enabled": crate::pool::is_pool_enabled(id),
        "connections": state.size,
        "idle": state.available,
        "waiting": state.waiting,
        "slots": slots,
    })
}

async fn switch_pool_backend(
    database: &str,
    user: &str,
    server_host: String,
    server_port: u16,
    client_server_map: ClientServerMap,
) -> Response {
    let mut config: Config = get_config();
    let pool_config = match config.pools.get_mut(database) {
        Some(pool_config) => pool_config,
        None => return Response::err(format!("no such database: {database}")),
    };
    if !pool_config.users.iter().any(|u| u.username == user) {
        return Response::err(format!("no such user {user} in database {database}"));
    }

    pool_config.server_host = server_host;
    pool_config.server_port = server_port;

    crate::config::replace_config(config);

    match ConnectionPool::from_config(client_server_map).await {
        Ok(()) => Response::ok(),
        Err(err) => Response::err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_and_status_parse_without_a_body() {
        assert!(matches!(
            serde_json::from_str::<Command>(r#"{"command":"ping"}"#).unwrap(),
            Command::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<Command>(r#"{"command":"status"}"#).unwrap(),
            Command::Status
        ));
    }

    #[test]
    fn flush_defaults_to_idle_mode() {
        let command: Command =
            serde_json::from_str(r#"{"command":"flush","database":"app","user":"app"}"#).unwrap();
        match command {
            Command::Flush {
                mode,
                database,
                user,
            } => {
                assert_eq!(mode, "idle");
                assert_eq!(database, "app");
                assert_eq!(user, "app");
            }
            other => panic!("expected Flush, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_defaults_to_graceful() {
        let command: Command = serde_json::from_str(r#"{"command":"shutdown"}"#).unwrap();
        assert!(matches!(command, Command::Shutdown { immediate: false }));

        let command: Command =
            serde_json::from_str(r#"{"command":"shutdown","immediate":true}"#).unwrap();
        assert!(matches!(command, Command::Shutdown { immediate: true }));
    }

    #[test]
    fn switch_requires_host_and_port() {
        let command: Command = serde_json::from_str(
            r#"{"command":"switch","database":"app","user":"app","server_host":"10.0.0.5","server_port":6432}"#,
        )
        .unwrap();
        match command {
            Command::Switch {
                database,
                user,
                server_host,
                server_port,
            } => {
                assert_eq!(database, "app");
                assert_eq!(user, "app");
                assert_eq!(server_host, "10.0.0.5");
                assert_eq!(server_port, 6432);
            }
            other => panic!("expected Switch, got {other:?}"),
        }
    }

    #[test]
    fn conf_get_parses_optional_key() {
        let command: Command =
            serde_json::from_str(r#"{"command":"conf","op":"get"}"#).unwrap();
        assert!(matches!(
            command,
            Command::Conf {
                op: ConfOp::Get,
                key: None,
                value: None
            }
        ));
    }

    #[test]
    fn unknown_command_fails_to_parse() {
        assert!(serde_json::from_str::<Command>(r#"{"command":"nonsense"}"#).is_err());
    }

    #[test]
    fn response_ok_omits_message_and_data() {
        let json = serde_json::to_value(Response::ok()).unwrap();
        assert_eq!(json, serde_json::json!({ "ok": true }));
    }

    #[test]
    fn response_err_carries_message_and_omits_data() {
        let json = serde_json::to_value(Response::err("no such pool")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "ok": false, "message": "no such pool" })
        );
    }

    #[test]
    fn response_ok_with_carries_data() {
        let json = serde_json::to_value(Response::ok_with(serde_json::json!("pong"))).unwrap();
        assert_eq!(json, serde_json::json!({ "ok": true, "data": "pong" }));
    }
}
