//! Prometheus metrics HTTP endpoint.
//!
//! A minimal HTTP server exposing broker metrics in Prometheus exposition
//! format. Runs in a dedicated thread with blocking I/O; it only reads the
//! atomic metrics sink, so it needs no coordination with the event loop.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::metrics::{BrokerMetrics, MESSAGE_SIZE_BUCKETS};

/// Cap on the HTTP request head; anything larger is not a metrics scrape.
const MAX_REQUEST_HEAD: usize = 8192;

/// Start the metrics HTTP server in a background thread.
pub fn start_metrics_server(bind: SocketAddr, metrics: Arc<BrokerMetrics>, start_time: Instant) {
    thread::Builder::new()
        .name("prometheus".to_string())
        .spawn(move || match TcpListener::bind(bind) {
            Ok(listener) => serve(listener, &metrics, start_time),
            Err(e) => error!("failed to bind metrics endpoint on {}: {}", bind, e),
        })
        .expect("Failed to spawn prometheus thread");

    info!("Prometheus metrics endpoint enabled at http://{}/metrics", bind);
}

/// Accept scrapes one at a time (blocking).
fn serve(listener: TcpListener, metrics: &BrokerMetrics, start_time: Instant) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                if let Err(e) = answer(&mut stream, metrics, start_time) {
                    debug!("metrics request error: {}", e);
                }
            }
            Err(e) => warn!("metrics accept error: {}", e),
        }
    }
}

/// Read one HTTP request and write the matching response. The only route is
/// `GET /metrics`; everything else gets a plain-text error status.
fn answer(
    stream: &mut TcpStream,
    metrics: &BrokerMetrics,
    start_time: Instant,
) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let request_line = read_request_line(stream)?;
    let mut words = request_line.split_whitespace();
    let method = words.next().unwrap_or("");
    let path = words.next().unwrap_or("");

    let (status, reason, body) = if method.is_empty() || path.is_empty() {
        (400, "Bad Request", "invalid request".to_string())
    } else if method != "GET" {
        (405, "Method Not Allowed", "only GET is supported".to_string())
    } else if path != "/metrics" && path != "/metrics/" {
        (404, "Not Found", "use /metrics".to_string())
    } else {
        (200, "OK", format_metrics(metrics, start_time))
    };

    let content_type = match status {
        200 => "text/plain; version=0.0.4; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    };

    let mut response = String::with_capacity(body.len() + 128);
    response.push_str(&format!("HTTP/1.1 {} {}\r\n", status, reason));
    response.push_str(&format!("Content-Type: {}\r\n", content_type));
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    response.push_str("Connection: close\r\n\r\n");
    response.push_str(&body);

    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Accumulate raw bytes until the blank line that ends the request head,
/// then hand back the request line. The remaining headers are irrelevant to
/// a scrape and are dropped with the buffer.
fn read_request_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|end| end == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_REQUEST_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }

    let head = String::from_utf8_lossy(&head);
    Ok(head.lines().next().unwrap_or("").to_string())
}

/// Format all metrics in Prometheus exposition format.
fn format_metrics(metrics: &BrokerMetrics, start_time: Instant) -> String {
    let mut out = String::with_capacity(4096);

    macro_rules! counter {
        ($name:expr, $help:expr, $value:expr) => {
            out.push_str("# HELP ");
            out.push_str($name);
            out.push(' ');
            out.push_str($help);
            out.push('\n');
            out.push_str("# TYPE ");
            out.push_str($name);
            out.push_str(" counter\n");
            out.push_str($name);
            out.push(' ');
            out.push_str(&$value.to_string());
            out.push('\n');
        };
    }

    macro_rules! gauge {
        ($name:expr, $help:expr, $value:expr) => {
            out.push_str("# HELP ");
            out.push_str($name);
            out.push(' ');
            out.push_str($help);
            out.push('\n');
            out.push_str("# TYPE ");
            out.push_str($name);
            out.push_str(" gauge\n");
            out.push_str($name);
            out.push(' ');
            out.push_str(&$value.to_string());
            out.push('\n');
        };
    }

    gauge!(
        "mqtt_uptime_seconds",
        "Broker uptime in seconds",
        start_time.elapsed().as_secs()
    );

    gauge!(
        "mqtt_active_connections",
        "Number of currently active MQTT connections",
        metrics.active_connections.load(Ordering::Relaxed)
    );

    gauge!(
        "mqtt_active_subscriptions",
        "Number of currently active topic subscriptions",
        metrics.active_subscriptions.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_total_connections",
        "Total number of connections accepted",
        metrics.total_connections.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_messages_published_total",
        "Total number of messages published",
        metrics.messages_published.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_messages_received_total",
        "Total number of messages received",
        metrics.messages_received.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_bytes_received_total",
        "Total number of bytes received",
        metrics.bytes_received.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_bytes_sent_total",
        "Total number of bytes sent",
        metrics.bytes_sent.load(Ordering::Relaxed)
    );

    counter!(
        "mqtt_connection_errors_total",
        "Total number of connection errors",
        metrics.connection_errors.load(Ordering::Relaxed)
    );

    // Message size histogram
    out.push_str("# HELP mqtt_message_size_bytes Distribution of message sizes in bytes\n");
    out.push_str("# TYPE mqtt_message_size_bytes histogram\n");
    let cumulative = metrics.message_size.cumulative_buckets();
    for (bound, count) in MESSAGE_SIZE_BUCKETS.iter().zip(cumulative.iter()) {
        out.push_str(&format!(
            "mqtt_message_size_bytes_bucket{{le=\"{}\"}} {}\n",
            bound, count
        ));
    }
    out.push_str(&format!(
        "mqtt_message_size_bytes_bucket{{le=\"+Inf\"}} {}\n",
        metrics.message_size.count()
    ));
    out.push_str(&format!(
        "mqtt_message_size_bytes_sum {}\n",
        metrics.message_size.sum()
    ));
    out.push_str(&format!(
        "mqtt_message_size_bytes_count {}\n",
        metrics.message_size.count()
    ));

    out
}
