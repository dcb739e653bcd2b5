// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal sink that publishes FLV tags over RTMP.
//!
//! The stage itself does no network I/O: tags cross an unbounded channel
//! to a connection task that owns the TCP stream, the chunk serializer
//! state, and the command conversation (connect, createStream, publish,
//! onStatus). That task is the only inter-task boundary on the egress
//! side of a stage chain.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;

use log::{debug, trace, warn};
use rml_amf0::Amf0Value;
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, RtmpMessage, UserControlEventType};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{replace_next, wrong_item_kind, Stage, StageItem};
use crate::flv::{FlvTag, TAG_AUDIO, TAG_SCRIPT, TAG_VIDEO};
use crate::{Error, ErrorInt};

const DEFAULT_RTMP_PORT: u16 = 1935;
const OUTBOUND_CHUNK_SIZE: u32 = 4096;
const READ_BUF_SIZE: usize = 8192;

const CONNECT_TRANSACTION: f64 = 1.0;
const CREATE_STREAM_TRANSACTION: f64 = 2.0;
const PUBLISH_TRANSACTION: f64 = 3.0;

/// Publishes incoming tags to an RTMP server as a live stream.
pub struct RtmpPublisher {
    next: Option<Box<dyn Stage>>,
    tx: mpsc::UnboundedSender<FlvTag>,
}

impl RtmpPublisher {
    /// Dials `url` (e.g. `rtmp://host/app`), performs the handshake and the
    /// publish command sequence for `stream_name`, and spawns the
    /// connection task. Returns once the server has confirmed
    /// `NetStream.Publish.Start`.
    pub async fn connect(url: &str, stream_name: &str) -> Result<RtmpPublisher, Error> {
        let endpoint = Endpoint::parse(url)?;
        let connection = RtmpConnection::establish(&endpoint, stream_name).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let label = format!("{url}/{stream_name}");
        tokio::spawn(async move {
            match connection.run(rx).await {
                Ok(()) => debug!("rtmp publisher for {label} finished"),
                Err(e) => warn!("rtmp publisher for {label} failed: {e}"),
            }
        });
        Ok(RtmpPublisher { next: None, tx })
    }
}

impl Stage for RtmpPublisher {
    fn process(&mut self, item: &mut StageItem) -> Result<(), Error> {
        let tag = match item {
            StageItem::Tag(tag) => tag.clone(),
            other => return Err(wrong_item_kind("RtmpPublisher", "tag", other)),
        };
        self.tx
            .send(tag)
            .map_err(|_| wrap!(ErrorInt::ConnectionClosed))
    }

    fn attach(&mut self, next: Box<dyn Stage>) {
        replace_next(&mut self.next, next);
    }

    fn release(&mut self) {
        if let Some(next) = self.next.as_mut() {
            next.release();
        }
    }
}

struct Endpoint {
    host: String,
    port: u16,
    app: String,
    tc_url: String,
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Endpoint, Error> {
        let url = url::Url::parse(raw).map_err(|e| {
            wrap!(ErrorInt::RtmpProtocol {
                description: format!("invalid RTMP url {raw:?}: {e}"),
            })
        })?;
        if url.scheme() != "rtmp" {
            bail!(ErrorInt::RtmpProtocol {
                description: format!("unsupported scheme {:?}", url.scheme()),
            });
        }
        let host = match url.host_str() {
            Some(h) => h.to_owned(),
            None => bail!(ErrorInt::RtmpProtocol {
                description: format!("no host in RTMP url {raw:?}"),
            }),
        };
        let app = url.path().trim_matches('/').to_owned();
        if app.is_empty() {
            bail!(ErrorInt::RtmpProtocol {
                description: format!("no application name in RTMP url {raw:?}"),
            });
        }
        Ok(Endpoint {
            port: url.port().unwrap_or(DEFAULT_RTMP_PORT),
            tc_url: raw.trim_end_matches('/').to_owned(),
            host,
            app,
        })
    }
}

/// The task half of the publisher: owns the socket and all chunk state.
struct RtmpConnection {
    stream: TcpStream,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
    events: VecDeque<RtmpMessage>,
    read_buf: Vec<u8>,
    stream_id: u32,
    bytes_received: u64,
    ack_window: Option<u32>,
    last_ack: u64,
}

impl RtmpConnection {
    async fn establish(endpoint: &Endpoint, stream_name: &str) -> Result<Self, Error> {
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| {
                wrap!(ErrorInt::Io {
                    context: format!("connecting to {}:{}", endpoint.host, endpoint.port),
                    source,
                })
            })?;

        let leftover = handshake(&mut stream).await?;
        let mut conn = RtmpConnection {
            stream,
            serializer: ChunkSerializer::new(),
            deserializer: ChunkDeserializer::new(),
            events: VecDeque::new(),
            read_buf: vec![0u8; READ_BUF_SIZE],
            stream_id: 0,
            bytes_received: 0,
            ack_window: None,
            last_ack: 0,
        };
        conn.ingest(&leftover)?;

        let packet = conn
            .serializer
            .set_max_chunk_size(OUTBOUND_CHUNK_SIZE, RtmpTimestamp::new(0))
            .map_err(|e| rtmp_err(format!("setting chunk size: {e:?}")))?;
        conn.write(&packet.bytes).await?;

        let mut connect_args = HashMap::new();
        connect_args.insert(
            "app".to_owned(),
            Amf0Value::Utf8String(endpoint.app.clone()),
        );
        connect_args.insert(
            "tcUrl".to_owned(),
            Amf0Value::Utf8String(endpoint.tc_url.clone()),
        );
        connect_args.insert(
            "flashVer".to_owned(),
            Amf0Value::Utf8String(concat!("FMLE/3.0 (compatible; ", env!("CARGO_PKG_NAME"), ")").to_owned()),
        );
        connect_args.insert("objectEncoding".to_owned(), Amf0Value::Number(0.0));
        conn.send_command(0, "connect", CONNECT_TRANSACTION, Amf0Value::Object(connect_args), vec![])
            .await?;
        conn.await_result(CONNECT_TRANSACTION, "connect").await?;

        conn.send_command(0, "createStream", CREATE_STREAM_TRANSACTION, Amf0Value::Null, vec![])
            .await?;
        let args = conn
            .await_result(CREATE_STREAM_TRANSACTION, "createStream")
            .await?;
        conn.stream_id = match args.first() {
            Some(Amf0Value::Number(id)) => *id as u32,
            other => {
                bail!(ErrorInt::RtmpProtocol {
                    description: format!("createStream result carried no stream id: {other:?}"),
                })
            }
        };

        conn.send_command(
            conn.stream_id,
            "publish",
            PUBLISH_TRANSACTION,
            Amf0Value::Null,
            vec![
                Amf0Value::Utf8String(stream_name.to_owned()),
                Amf0Value::Utf8String("live".to_owned()),
            ],
        )
        .await?;
        conn.await_publish_start().await?;
        debug!(
            "publishing {stream_name:?} on stream id {} at {}:{}",
            conn.stream_id, endpoint.host, endpoint.port
        );
        Ok(conn)
    }

    /// Pumps tags from the stage into the connection and keeps answering
    /// the server's control messages. Ends orderly when the stage side
    /// hangs up, with an error when the server does.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FlvTag>) -> Result<(), Error> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                tag = rx.recv() => match tag {
                    Some(tag) => self.publish_data(tag).await?,
                    None => {
                        let _ = self.stream.shutdown().await;
                        return Ok(());
                    }
                },
                read = self.stream.read(&mut buf) => {
                    let n = read.map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;
                    if n == 0 {
                        bail!(ErrorInt::ConnectionClosed);
                    }
                    let input = buf[..n].to_vec();
                    self.receive(&input).await?;
                    while let Some(event) = self.events.pop_front() {
                        trace!("ignoring rtmp message while publishing: {event:?}");
                    }
                }
            }
        }
    }

    /// `(tag_type, data, timestamp)`: the publish-data contract.
    async fn publish_data(&mut self, tag: FlvTag) -> Result<(), Error> {
        let message = match tag.tag_type {
            TAG_VIDEO => RtmpMessage::VideoData { data: tag.data },
            TAG_AUDIO => RtmpMessage::AudioData { data: tag.data },
            TAG_SCRIPT => {
                let mut cursor = Cursor::new(&tag.data[..]);
                let values = rml_amf0::deserialize(&mut cursor)
                    .map_err(|e| rtmp_err(format!("script tag is not AMF0: {e:?}")))?;
                RtmpMessage::Amf0Data { values }
            }
            other => {
                debug!("not publishing unknown tag type {other}");
                return Ok(());
            }
        };
        self.send_message(self.stream_id, message, RtmpTimestamp::new(tag.timestamp_ms))
            .await
    }

    async fn send_command(
        &mut self,
        stream_id: u32,
        name: &str,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
    ) -> Result<(), Error> {
        self.send_message(
            stream_id,
            RtmpMessage::Amf0Command {
                command_name: name.to_owned(),
                transaction_id,
                command_object,
                additional_arguments,
            },
            RtmpTimestamp::new(0),
        )
        .await
    }

    async fn send_message(
        &mut self,
        stream_id: u32,
        message: RtmpMessage,
        timestamp: RtmpTimestamp,
    ) -> Result<(), Error> {
        let payload = MessagePayload::from_rtmp_message(message, timestamp, stream_id)
            .map_err(|e| rtmp_err(format!("serializing message: {e:?}")))?;
        let packet = self
            .serializer
            .serialize(&payload, false, false)
            .map_err(|e| rtmp_err(format!("chunking message: {e:?}")))?;
        self.write(&packet.bytes).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|_| wrap!(ErrorInt::ConnectionClosed))
    }

    /// Blocks for the `_result` of `transaction_id`, servicing control
    /// messages on the way.
    async fn await_result(
        &mut self,
        transaction_id: f64,
        what: &'static str,
    ) -> Result<Vec<Amf0Value>, Error> {
        loop {
            match self.next_event().await? {
                RtmpMessage::Amf0Command {
                    command_name,
                    transaction_id: tid,
                    additional_arguments,
                    ..
                } => {
                    if command_name == "_result" && tid == transaction_id {
                        return Ok(additional_arguments);
                    }
                    if command_name == "_error" && tid == transaction_id {
                        bail!(ErrorInt::RtmpProtocol {
                            description: format!("{what} rejected: {additional_arguments:?}"),
                        });
                    }
                    debug!("ignoring command {command_name:?} while waiting for {what}");
                }
                other => trace!("ignoring message while waiting for {what}: {other:?}"),
            }
        }
    }

    async fn await_publish_start(&mut self) -> Result<(), Error> {
        loop {
            match self.next_event().await? {
                RtmpMessage::Amf0Command {
                    command_name,
                    additional_arguments,
                    ..
                } if command_name == "onStatus" => {
                    let code = additional_arguments.iter().find_map(|v| match v {
                        Amf0Value::Object(props) => match props.get("code") {
                            Some(Amf0Value::Utf8String(code)) => Some(code.clone()),
                            _ => None,
                        },
                        _ => None,
                    });
                    match code.as_deref() {
                        Some("NetStream.Publish.Start") => return Ok(()),
                        Some(code) if code.starts_with("NetStream.Publish") => {
                            bail!(ErrorInt::RtmpProtocol {
                                description: format!("publish refused: {code}"),
                            });
                        }
                        _ => debug!("ignoring onStatus {code:?}"),
                    }
                }
                other => trace!("ignoring message while waiting for publish start: {other:?}"),
            }
        }
    }

    /// Delivers the next non-control message, reading as needed.
    async fn next_event(&mut self) -> Result<RtmpMessage, Error> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            let n = self
                .stream
                .read(&mut self.read_buf[..])
                .await
                .map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;
            if n == 0 {
                bail!(ErrorInt::ConnectionClosed);
            }
            let input = self.read_buf[..n].to_vec();
            self.receive(&input).await?;
        }
    }

    /// Feeds received bytes through the chunk deserializer, handles
    /// control messages inline, and queues the rest as events.
    async fn receive(&mut self, input: &[u8]) -> Result<(), Error> {
        self.bytes_received += input.len() as u64;
        self.ingest(input)?;
        self.maybe_acknowledge().await
    }

    fn ingest(&mut self, input: &[u8]) -> Result<(), Error> {
        let mut chunk = input;
        loop {
            let payload = self
                .deserializer
                .get_next_message(chunk)
                .map_err(|e| rtmp_err(format!("dechunking failed: {e:?}")))?;
            chunk = &[];
            let payload = match payload {
                Some(p) => p,
                None => return Ok(()),
            };
            let message = match payload.to_rtmp_message() {
                Ok(m) => m,
                Err(e) => {
                    debug!("skipping undecodable rtmp message: {e:?}");
                    continue;
                }
            };
            match message {
                RtmpMessage::SetChunkSize { size } => {
                    self.deserializer
                        .set_max_chunk_size(size as usize)
                        .map_err(|e| rtmp_err(format!("peer chunk size invalid: {e:?}")))?;
                }
                RtmpMessage::WindowAcknowledgement { size } => {
                    self.ack_window = Some(size);
                }
                RtmpMessage::SetPeerBandwidth { .. } | RtmpMessage::Acknowledgement { .. } => {}
                RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingRequest,
                    timestamp,
                    ..
                } => {
                    // Answered outside ingest to keep this non-async; queue
                    // it as an event the callers treat uniformly.
                    self.events.push_back(RtmpMessage::UserControl {
                        event_type: UserControlEventType::PingRequest,
                        stream_id: None,
                        buffer_length: None,
                        timestamp,
                    });
                }
                other => self.events.push_back(other),
            }
        }
    }

    async fn maybe_acknowledge(&mut self) -> Result<(), Error> {
        // Answer ping requests queued by ingest.
        let mut pings = Vec::new();
        self.events.retain(|e| {
            if let RtmpMessage::UserControl {
                event_type: UserControlEventType::PingRequest,
                timestamp,
                ..
            } = e
            {
                pings.push(*timestamp);
                false
            } else {
                true
            }
        });
        for timestamp in pings {
            self.send_message(
                0,
                RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingResponse,
                    stream_id: None,
                    buffer_length: None,
                    timestamp,
                },
                RtmpTimestamp::new(0),
            )
            .await?;
        }

        if let Some(window) = self.ack_window {
            if self.bytes_received - self.last_ack >= u64::from(window) {
                self.last_ack = self.bytes_received;
                self.send_message(
                    0,
                    RtmpMessage::Acknowledgement {
                        sequence_number: self.bytes_received as u32,
                    },
                    RtmpTimestamp::new(0),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Client side of the RTMP handshake; returns bytes received past its end.
async fn handshake(stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_and_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| rtmp_err(format!("generating handshake: {e:?}")))?;
    stream
        .write_all(&p0_and_p1)
        .await
        .map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;
        if n == 0 {
            bail!(ErrorInt::ConnectionClosed);
        }
        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| rtmp_err(format!("handshake failed: {e:?}")))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;
                }
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(|_| wrap!(ErrorInt::ConnectionClosed))?;
                }
                return Ok(remaining_bytes);
            }
        }
    }
}

fn rtmp_err(description: String) -> Error {
    wrap!(ErrorInt::RtmpProtocol { description })
}
