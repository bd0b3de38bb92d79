use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickstream::{ConnectionStatus, PriceStreamClient, StreamArgs, StreamConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};

fn config_for(port: u16) -> StreamConfig {
    StreamArgs {
        stream_base_url: Some(format!("ws://127.0.0.1:{port}")),
        rest_base_url: Some("http://127.0.0.1:9".to_string()),
        initial_backoff_ms: Some(200),
        history_capacity: Some(64),
        ..StreamArgs::default()
    }
    .normalize()
    .expect("test config should be valid")
}

fn trade_frame(price: f64, trade_time_ms: i64) -> Message {
    Message::Text(format!(
        r#"{{"e":"trade","E":{trade_time_ms},"s":"TESTUSDT","t":1,"p":"{price}","q":"0.5","T":{trade_time_ms},"m":false}}"#
    ))
}

async fn wait_until<F>(predicate: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn drain_until_gone(mut ws: WebSocketStream<TcpStream>) {
    while let Some(frame) = ws.next().await {
        if frame.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn streams_valid_trades_and_skips_malformed_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(socket).await.expect("handshake");
        ws.send(trade_frame(100.5, 1_700_000_000_000))
            .await
            .expect("send first trade");
        ws.send(Message::Text("{this is not json".to_string()))
            .await
            .expect("send malformed frame");
        ws.send(trade_frame(101.5, 1_700_000_001_000))
            .await
            .expect("send second trade");
        drain_until_gone(ws).await;
    });

    let client = PriceStreamClient::new(config_for(port));
    client.start("TESTUSDT").expect("start should succeed");

    wait_until(|| client.series().1.len() >= 2, Duration::from_secs(5)).await;

    let (timestamps, prices) = client.series();
    assert_eq!(prices, vec![100.5, 101.5]);
    assert_eq!(timestamps, vec![1_700_000_000.0, 1_700_000_001.0]);
    assert_eq!(client.latest_price(), Some(101.5));
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(client.connection_info().message_count, 2);

    client.stop();
    server.abort();
}

#[tokio::test]
async fn reconnects_with_backoff_after_remote_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("accept first");
        let mut ws = accept_async(socket).await.expect("handshake first");
        ws.send(trade_frame(100.0, 1_700_000_000_000))
            .await
            .expect("send before close");
        ws.close(None).await.ok();
        drop(ws);

        let (socket, _) = listener.accept().await.expect("accept second");
        let mut ws = accept_async(socket).await.expect("handshake second");
        ws.send(trade_frame(200.0, 1_700_000_002_000))
            .await
            .expect("send after reconnect");
        drain_until_gone(ws).await;
    });

    let client = PriceStreamClient::new(config_for(port));
    client.start("TESTUSDT").expect("start should succeed");

    wait_until(
        || client.series().1.contains(&200.0),
        Duration::from_secs(10),
    )
    .await;

    // The history survives a reconnect; only start/stop clear it.
    let (_, prices) = client.series();
    assert!(prices.contains(&100.0));
    assert!(client.connection_info().error_count >= 1);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.stop();
    server.abort();
}

#[tokio::test]
async fn stop_reports_disconnected_and_fences_late_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(socket).await else {
                continue;
            };
            let mut tick = 0_i64;
            loop {
                tick += 1;
                let frame = trade_frame(100.0 + tick as f64, 1_700_000_000_000 + tick * 1_000);
                if ws.send(frame).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    });

    let client = PriceStreamClient::new(config_for(port));
    client.start("TESTUSDT").expect("start should succeed");
    wait_until(|| client.latest_price().is_some(), Duration::from_secs(5)).await;

    client.stop();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.connection_info().symbol, None);

    // Frames still in flight from the old session must not reappear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.latest_price(), None);
    assert!(client.series().0.is_empty());
    assert_eq!(client.status(), ConnectionStatus::Disconnected);

    server.abort();
}

#[tokio::test]
async fn symbol_switch_never_mixes_sessions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    // Each connection streams a price derived from the requested stream
    // path, so cross-session contamination is observable.
    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let path = Arc::new(Mutex::new(String::new()));
            let seen_path = Arc::clone(&path);
            let Ok(mut ws) = accept_hdr_async(socket, move |request: &Request, response: Response| {
                *seen_path.lock().expect("path lock") = request.uri().path().to_string();
                Ok(response)
            })
            .await
            else {
                continue;
            };

            let price = if path.lock().expect("path lock").contains("aaausdt") {
                111.0
            } else {
                222.0
            };
            let mut tick = 0_i64;
            loop {
                tick += 1;
                let frame = trade_frame(price, 1_700_000_000_000 + tick * 1_000);
                if ws.send(frame).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    });

    let client = PriceStreamClient::new(config_for(port));
    client.start("AAAUSDT").expect("start should succeed");
    wait_until(
        || client.series().1.contains(&111.0),
        Duration::from_secs(5),
    )
    .await;

    client.start("BBBUSDT").expect("switch should succeed");
    let (_, prices) = client.series();
    assert!(
        prices.iter().all(|price| *price == 222.0),
        "old-session prices survived the switch: {prices:?}"
    );

    wait_until(|| !client.series().1.is_empty(), Duration::from_secs(5)).await;
    let (_, prices) = client.series();
    assert!(
        prices.iter().all(|price| *price == 222.0),
        "old-session prices leaked into the new buffer: {prices:?}"
    );
    assert_eq!(client.connection_info().symbol.as_deref(), Some("bbbusdt"));

    client.stop();
    server.abort();
}
