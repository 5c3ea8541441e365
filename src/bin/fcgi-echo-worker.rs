//! Echo worker for integration testing
//!
//! Started the way a FastCGI application is: `fcgi-echo-worker -b <socket>`.
//! Every connection gets back exactly the bytes it sent, then EOF.
//!
//! This is a test double for the integration tests, not part of the manager.
//! It is a `[[bin]]` of this package only so tests can locate it through
//! `CARGO_BIN_EXE_fcgi-echo-worker`; install with `--bin fcgi-pool`.
//!
//! Environment variables:
//! - ECHO_WORKER_STARTUP_DELAY_MS: Delay before binding the socket (default: 0)

#[cfg(unix)]
#[tokio::main]
async fn main() {
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    let args: Vec<String> = std::env::args().collect();
    let Some(endpoint) = args
        .iter()
        .position(|arg| arg == "-b")
        .and_then(|pos| args.get(pos + 1))
    else {
        eprintln!("Echo worker: usage: fcgi-echo-worker -b <socket>");
        std::process::exit(2);
    };

    let startup_delay: u64 = std::env::var("ECHO_WORKER_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("Echo worker: sleeping for {}ms before binding", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = match UnixListener::bind(endpoint) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Echo worker: failed to bind {}: {}", endpoint, e);
            std::process::exit(1);
        }
    };

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
                        eprintln!("Echo worker: connection error: {}", e);
                    }
                    let _ = writer.shutdown().await;
                });
            }
            Err(e) => {
                eprintln!("Echo worker: accept error: {}", e);
            }
        }
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("Echo worker: only UNIX domain sockets are supported");
    std::process::exit(1);
}
