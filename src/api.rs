use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::runtime::Snapshot;

pub const DEFAULT_API_PORT: u16 = 8097;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

/// Read-only HTTP view of the latest snapshot. The run loop owns the timing
/// state and publishes into `state`; request threads only ever read it.
pub struct ApiServer {
    pub state: Arc<Mutex<Snapshot>>,
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, initial: Snapshot) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let local_addr = server.server_addr().to_ip();
        let state = Arc::new(Mutex::new(initial));
        let stop = Arc::new(AtomicBool::new(false));
        let state_for_thread = Arc::clone(&state);
        let stop_for_thread = Arc::clone(&stop);
        let http_join =
            thread::spawn(move || run_server_loop(server, state_for_thread, stop_for_thread));
        info!("snapshot API listening on {}", local_addr.map_or(bind, |addr| addr.to_string()));

        Ok(Self {
            state,
            local_addr,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, state: Arc<Mutex<Snapshot>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &state),
            Ok(None) => continue,
            Err(err) => debug!("API receive failed: {err}"),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Reply {
    Json(u16, Value),
    Text(u16, &'static str),
}

fn handle_request(request: tiny_http::Request, state: &Arc<Mutex<Snapshot>>) {
    if let Some(remote) = request.remote_addr()
        && !is_local_network_ip(remote.ip())
    {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let reply = match state.lock() {
        Ok(guard) => route(request.method(), request.url(), &guard),
        Err(_) => Reply::Text(500, "internal state lock error"),
    };
    let sent = match reply {
        Reply::Json(status, body) => send_json(request, StatusCode(status), &body),
        Reply::Text(status, body) => send_text(request, StatusCode(status), body),
    };
    if let Err(err) = sent {
        warn!("failed to answer API request: {err:#}");
    }
}

fn route(method: &Method, url: &str, snapshot: &Snapshot) -> Reply {
    if method != &Method::Get {
        return Reply::Text(405, "method not allowed");
    }
    let (path, query) = split_path_query(url);
    match path {
        "/healthz" => Reply::Text(200, "ok"),
        "/v1" => Reply::Json(
            200,
            json!({
                "state_url": "/v1/state",
                "timers_url": "/v1/timers",
                "alarms_url": "/v1/alarms",
            }),
        ),
        "/v1/state" => to_reply(snapshot),
        "/v1/timers" => match query_param(query, "id") {
            Some(id) => match snapshot.timers.iter().find(|timer| timer.id == id) {
                Some(timer) => to_reply(timer),
                None => Reply::Text(404, "unknown timer"),
            },
            None => to_reply(&snapshot.timers),
        },
        "/v1/alarms" => match query_param(query, "id") {
            Some(id) => match snapshot.alarms.iter().find(|alarm| alarm.id == id) {
                Some(alarm) => to_reply(alarm),
                None => Reply::Text(404, "unknown alarm"),
            },
            None => to_reply(&snapshot.alarms),
        },
        _ => Reply::Text(404, "not found"),
    }
}

fn to_reply<T: Serialize>(body: &T) -> Reply {
    match serde_json::to_value(body) {
        Ok(value) => Reply::Json(200, value),
        Err(_) => Reply::Text(500, "failed to encode response"),
    }
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    url.split_once('?').unwrap_or((url, ""))
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| v4.is_loopback() || v4.is_private())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    use super::*;
    use crate::alerts::DEFAULT_SOUND;
    use crate::timer::model::Timer;

    fn sample() -> Snapshot {
        Snapshot {
            now_ms: 1_700_000_000_000,
            clock: "MANUAL".to_string(),
            pinned_timer: Some("timer-1".to_string()),
            timers: vec![Timer::countdown(
                "timer-1".to_string(),
                "eggs".to_string(),
                10_000,
                DEFAULT_SOUND.to_string(),
            )],
            alarms: Vec::new(),
        }
    }

    #[test]
    fn state_route_serves_snapshot() {
        let Reply::Json(200, body) = route(&Method::Get, "/v1/state", &sample()) else {
            panic!("expected JSON reply");
        };
        assert_eq!(body["nowMs"], 1_700_000_000_000_i64);
        assert_eq!(body["pinnedTimer"], "timer-1");
        assert_eq!(body["timers"][0]["initialDuration"], 10_000);
    }

    #[test]
    fn timer_lookup_by_query() {
        let Reply::Json(200, body) = route(&Method::Get, "/v1/timers?id=timer-1", &sample())
        else {
            panic!("expected JSON reply");
        };
        assert_eq!(body["title"], "eggs");
        assert_eq!(
            route(&Method::Get, "/v1/timers?id=nope", &sample()),
            Reply::Text(404, "unknown timer")
        );
    }

    #[test]
    fn non_get_and_unknown_paths_are_refused() {
        assert_eq!(
            route(&Method::Post, "/v1/state", &sample()),
            Reply::Text(405, "method not allowed")
        );
        assert_eq!(
            route(&Method::Get, "/v2", &sample()),
            Reply::Text(404, "not found")
        );
        assert_eq!(route(&Method::Get, "/healthz", &sample()), Reply::Text(200, "ok"));
    }

    #[test]
    fn query_param_extracts_value() {
        assert_eq!(query_param("a=1&id=timer-2", "id"), Some("timer-2"));
        assert_eq!(query_param("flag&id=", "flag"), Some(""));
        assert_eq!(query_param("", "id"), None);
    }

    #[test]
    fn local_network_filter() {
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_local_network_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))));
        assert!(!is_local_network_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn server_answers_over_http() {
        let server = ApiServer::start(
            ApiServerConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 0,
            },
            sample(),
        )
        .expect("start server");
        let addr = server.local_addr().expect("bound address");

        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read response");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));
    }
}
