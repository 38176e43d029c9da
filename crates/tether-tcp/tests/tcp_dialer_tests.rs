//! End-to-end tests for the TCP dialer against local listeners.

use std::time::Duration;

use tether_tcp::{Connection, ConnectionState, DialOptions, Dialer, TcpDialer, TransportError};
use tether_transport_traits::{KeepAliveConfig, TlsConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_dial_reaches_ready_and_echoes() {
    let addr = echo_server().await;
    let conn = TcpDialer::new()
        .dial(&addr, &DialOptions::default())
        .await
        .unwrap();

    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.address(), addr);
    assert!(conn.peer_addr().is_some());

    let reply = conn
        .with_stream(|stream| {
            Box::pin(async move {
                stream.write_all(b"ping").await?;
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await?;
                Ok::<_, std::io::Error>(buf)
            })
        })
        .await
        .unwrap();
    assert_eq!(&reply, b"ping");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_keep_alive_settings_are_applied() {
    let addr = echo_server().await;
    let options = DialOptions {
        keep_alive: Some(KeepAliveConfig {
            time: Duration::from_secs(42),
            interval: Duration::from_secs(7),
        }),
        ..DialOptions::default()
    };
    let conn = TcpDialer::new().dial(&addr, &options).await.unwrap();

    let (enabled, time, interval) = conn
        .with_stream(|stream| {
            Box::pin(async move {
                let sock = socket2::SockRef::from(&*stream);
                Ok::<_, std::io::Error>((
                    sock.keepalive()?,
                    sock.tcp_keepalive_time()?,
                    sock.tcp_keepalive_interval()?,
                ))
            })
        })
        .await
        .unwrap();
    assert!(enabled);
    assert_eq!(time, Duration::from_secs(42));
    assert_eq!(interval, Duration::from_secs(7));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_keep_alive_disabled() {
    let addr = echo_server().await;
    let options = DialOptions {
        keep_alive: None,
        ..DialOptions::default()
    };
    let conn = TcpDialer::new().dial(&addr, &options).await.unwrap();

    let enabled = conn
        .with_stream(|stream| {
            Box::pin(async move { socket2::SockRef::from(&*stream).keepalive() })
        })
        .await
        .unwrap();
    assert!(!enabled);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let addr = echo_server().await;
    let conn = TcpDialer::new()
        .dial(&addr, &DialOptions::default())
        .await
        .unwrap();

    conn.close().unwrap();
    assert_eq!(conn.state(), ConnectionState::Shutdown);
    assert!(matches!(conn.close(), Err(TransportError::Closed)));

    let result = conn
        .with_stream(|stream| Box::pin(async move { stream.write_all(b"x").await }))
        .await;
    assert!(matches!(result, Err(TransportError::Closed)));
}

#[tokio::test]
async fn test_refused_connection_fails() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = TcpDialer::new().dial(&addr, &DialOptions::default()).await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_tls_is_rejected() {
    let options = DialOptions {
        tls: TlsConfig::modern(),
        ..DialOptions::default()
    };
    let result = TcpDialer::new().dial("127.0.0.1:1", &options).await;
    assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_io_failure_marks_transient_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        // Accept and immediately hang up
        if let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let conn = TcpDialer::new()
        .dial(&addr, &DialOptions::default())
        .await
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        conn.with_stream(|stream| {
            Box::pin(async move {
                let mut buf = [0u8; 1];
                stream.read_exact(&mut buf).await.map(|_| ())
            })
        }),
    )
    .await
    .expect("read should fail promptly once the peer hangs up");

    assert!(result.is_err());
    assert_eq!(conn.state(), ConnectionState::TransientFailure);
    assert!(!conn.is_healthy());
}
