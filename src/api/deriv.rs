use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{BotError, Result};
use crate::execution::price_feed::{FeedAdapter, FeedConfig};
use crate::models::{Candle, Tick, Timeframe};

const TICK_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug, Deserialize)]
struct DerivMessage {
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    error: Option<DerivError>,
    #[serde(default)]
    tick: Option<DerivTick>,
    #[serde(default)]
    candles: Option<Vec<DerivCandle>>,
}

#[derive(Debug, Deserialize)]
struct DerivError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct DerivTick {
    epoch: i64,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default)]
    quote: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DerivCandle {
    epoch: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

/// One decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(Tick),
    Candles(Vec<Candle>),
    Pong,
    Other(String),
}

fn epoch_to_utc(epoch: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(epoch, 0)
        .ok_or_else(|| BotError::Feed(format!("invalid epoch {}", epoch)))
}

/// Decode a Deriv websocket frame; an `error` payload becomes `Err`
pub fn parse_message(text: &str) -> Result<FeedMessage> {
    let message: DerivMessage = serde_json::from_str(text)?;

    if let Some(error) = message.error {
        return Err(BotError::Feed(format!("{}: {}", error.code, error.message)));
    }

    if let Some(tick) = message.tick {
        let (bid, ask) = match (tick.bid, tick.ask, tick.quote) {
            (Some(bid), Some(ask), _) => (bid, ask),
            (_, _, Some(quote)) => (quote, quote),
            _ => return Err(BotError::Feed("tick without bid/ask or quote".to_string())),
        };
        return Ok(FeedMessage::Tick(Tick::new(bid, ask, epoch_to_utc(tick.epoch)?)));
    }

    if let Some(candles) = message.candles {
        let candles = candles
            .into_iter()
            .map(|c| {
                Ok(Candle {
                    period_start: epoch_to_utc(c.epoch)?,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: 0.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(FeedMessage::Candles(candles));
    }

    match message.msg_type.as_deref() {
        Some("ping") => Ok(FeedMessage::Pong),
        other => Ok(FeedMessage::Other(other.unwrap_or_default().to_string())),
    }
}

/// Deriv websocket tick source
#[derive(Debug, Clone)]
pub struct DerivFeed {
    ws_url: String,
    symbol: String,
    ping_interval: Duration,
    read_timeout: Duration,
}

impl DerivFeed {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            symbol: config.symbol.clone(),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
        }
    }

    /// Read frames until `extract` yields a value, answering pings on the way
    async fn await_frame<T>(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        mut extract: impl FnMut(FeedMessage) -> Option<T>,
    ) -> Result<T> {
        let deadline = tokio::time::sleep(self.read_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(BotError::Feed(format!(
                        "no response within {:?}",
                        self.read_timeout
                    )));
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(value) = extract(parse_message(&text)?) {
                            return Ok(value);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(BotError::Feed("connection closed by server".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

#[async_trait]
impl FeedAdapter for DerivFeed {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = serde_json::json!({ "ticks": symbol, "subscribe": 1 });
        write.send(Message::Text(subscribe_msg.to_string())).await?;

        // First tick (or the error, e.g. market closed) confirms the subscription
        let first = self
            .await_frame(&mut write, &mut read, |msg| match msg {
                FeedMessage::Tick(tick) => Some(tick),
                _ => None,
            })
            .await?;
        tracing::info!("Subscribed to {} ticks via WebSocket", symbol);

        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        // Fresh channel with room to spare
        let _ = tx.try_send(first);

        let ping_interval = self.ping_interval;
        let read_timeout = self.read_timeout;
        tokio::spawn(async move {
            if let Err(e) = stream_ticks(write, read, &tx, ping_interval, read_timeout).await {
                tracing::warn!("Deriv tick stream ended: {}", e);
            }
        });

        Ok(rx)
    }

    async fn backfill(&self, timeframe: Timeframe, count: usize) -> Result<Vec<Candle>> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let request = serde_json::json!({
            "ticks_history": self.symbol,
            "style": "candles",
            "granularity": timeframe.duration_secs(),
            "count": count,
            "end": "latest",
            "adjust_start_time": 1,
        });
        write.send(Message::Text(request.to_string())).await?;

        let candles = self
            .await_frame(&mut write, &mut read, |msg| match msg {
                FeedMessage::Candles(candles) => Some(candles),
                _ => None,
            })
            .await?;

        let _ = write.send(Message::Close(None)).await;
        Ok(candles)
    }
}

/// Forward ticks until the server goes quiet, closes, or the receiver is dropped
async fn stream_ticks(
    mut write: WsWrite,
    mut read: WsRead,
    tx: &mpsc::Sender<Tick>,
    ping_interval: Duration,
    read_timeout: Duration,
) -> Result<()> {
    let mut ping_tick = tokio::time::interval(ping_interval);
    ping_tick.tick().await;

    // Only real frames push the deadline out; our own pings must not
    let read_deadline = tokio::time::sleep(read_timeout);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                write.send(Message::Text(serde_json::json!({ "ping": 1 }).to_string())).await?;
            }
            _ = &mut read_deadline => {
                return Err(BotError::Feed(format!(
                    "read timed out after {:?} without messages",
                    read_timeout
                )));
            }
            msg = read.next() => {
                read_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + read_timeout);

                let msg = match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::warn!("WebSocket stream ended");
                        return Ok(());
                    }
                };

                match msg {
                    Ok(Message::Text(text)) => match parse_message(&text) {
                        Ok(FeedMessage::Tick(tick)) => {
                            if tx.send(tick).await.is_err() {
                                tracing::debug!("Tick receiver dropped, closing WebSocket");
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(());
                            }
                        }
                        Ok(FeedMessage::Pong) => tracing::trace!("Received keepalive pong"),
                        Ok(_) => {}
                        Err(BotError::Json(e)) => {
                            tracing::debug!("Ignoring undecodable frame: {}", e);
                        }
                        Err(e) => return Err(e),
                    },
                    Ok(Message::Ping(data)) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_tick() {
        let text = r#"{
            "echo_req": {"ticks": "frxXAUUSD", "subscribe": 1},
            "msg_type": "tick",
            "subscription": {"id": "abc"},
            "tick": {"ask": 2650.2, "bid": 2649.8, "epoch": 1714557605, "quote": 2650.0, "symbol": "frxXAUUSD"}
        }"#;

        match parse_message(text).unwrap() {
            FeedMessage::Tick(tick) => {
                assert_eq!(tick.bid, 2649.8);
                assert_eq!(tick.ask, 2650.2);
                assert!((tick.mid - 2650.0).abs() < 1e-9);
                assert_eq!(tick.timestamp, Utc.timestamp_opt(1714557605, 0).unwrap());
            }
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tick_quote_only() {
        let text = r#"{"msg_type":"tick","tick":{"epoch":1714557605,"quote":2650.5}}"#;
        match parse_message(text).unwrap() {
            FeedMessage::Tick(tick) => {
                assert_eq!(tick.mid, 2650.5);
                assert_eq!(tick.spread(), 0.0);
            }
            other => panic!("expected tick, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_candles() {
        let text = r#"{
            "msg_type": "candles",
            "candles": [
                {"epoch": 1714557600, "open": 2650.0, "high": 2651.0, "low": 2649.0, "close": 2650.5},
                {"epoch": 1714557660, "open": 2650.5, "high": 2652.0, "low": 2650.1, "close": 2651.7}
            ]
        }"#;

        match parse_message(text).unwrap() {
            FeedMessage::Candles(candles) => {
                assert_eq!(candles.len(), 2);
                assert_eq!(candles[1].close, 2651.7);
                assert!(candles[0].period_start < candles[1].period_start);
            }
            other => panic!("expected candles, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_payload() {
        let text = r#"{"error":{"code":"MarketIsClosed","message":"This market is presently closed."},"msg_type":"tick"}"#;
        let err = parse_message(text).unwrap_err();
        assert!(err.to_string().contains("MarketIsClosed"));
    }

    #[test]
    fn test_parse_ping_and_unknown() {
        assert_eq!(
            parse_message(r#"{"msg_type":"ping","ping":"pong"}"#).unwrap(),
            FeedMessage::Pong
        );
        assert_eq!(
            parse_message(r#"{"msg_type":"time","time":1714557605}"#).unwrap(),
            FeedMessage::Other("time".to_string())
        );
        assert!(parse_message("not json").is_err());
    }

    async fn local_server(frames: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Wait for the request before answering
            let _ = ws.next().await;
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            let _ = ws.close(None).await;
        });

        format!("ws://{}", addr)
    }

    fn feed(url: String) -> DerivFeed {
        DerivFeed::new(&FeedConfig {
            ws_url: url,
            read_timeout_secs: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_subscribe_streams_until_close() {
        let frames = vec![
            r#"{"msg_type":"tick","tick":{"epoch":1714557605,"bid":2649.8,"ask":2650.2}}"#.to_string(),
            r#"{"msg_type":"tick","tick":{"epoch":1714557606,"bid":2650.0,"ask":2650.4}}"#.to_string(),
        ];
        let url = local_server(frames).await;

        let mut rx = feed(url).subscribe("frxXAUUSD").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().bid, 2649.8);
        assert_eq!(rx.recv().await.unwrap().bid, 2650.0);
        // Server closed: channel ends
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_fails_when_market_closed() {
        let frames = vec![
            r#"{"error":{"code":"MarketIsClosed","message":"closed"},"msg_type":"tick"}"#.to_string(),
        ];
        let url = local_server(frames).await;

        assert!(feed(url).subscribe("frxXAUUSD").await.is_err());
    }

    #[tokio::test]
    async fn test_backfill_reads_candles() {
        let frames = vec![
            r#"{"msg_type":"ping","ping":"pong"}"#.to_string(),
            r#"{"msg_type":"candles","candles":[{"epoch":1714557600,"open":1,"high":2,"low":0.5,"close":1.5}]}"#.to_string(),
        ];
        let url = local_server(frames).await;

        let candles = feed(url).backfill(Timeframe::M1, 1).await.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 2.0);
    }
}
