//! HTTP RPC surface of a storage node, and the matching peer client.
//!
//! Control fields travel as JSON; block payloads travel as binary bodies
//! with a small length-prefixed framing so bytes are never re-encoded.
//! Streamed responses (`CopyExtent`, heartbeat) carry a 4-byte big-endian
//! header length, the JSON header, then raw payload chunks.
//!
//! Every response carries an in-band [`Code`]; transport-level failures
//! surface as [`BasaltError::Network`] on the client side instead.

use super::ExtentNode;
use crate::error::{BasaltError, Result};
use crate::pool::{Connector, CopyStream, PeerClient};
use crate::storage::{Entry, ReadEntriesResult};
use crate::types::{Block, Code, CopyHeader, ExtentId, RecoveryTask};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Response of `Append` and `ReplicateBlocks`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_des: Option<String>,
    #[serde(default)]
    pub offsets: Vec<u32>,
    #[serde(default)]
    pub end: u32,
}

impl WriteResponse {
    fn ok(offsets: Vec<u32>, end: u32) -> Self {
        Self {
            code: Code::Ok,
            code_des: None,
            offsets,
            end,
        }
    }

    fn error(err: &BasaltError) -> Self {
        Self {
            code: Code::Error,
            code_des: Some(err.to_string()),
            offsets: Vec::new(),
            end: 0,
        }
    }
}

/// Response carrying only a code.
#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_des: Option<String>,
}

impl CodeResponse {
    fn ok() -> Self {
        Self {
            code: Code::Ok,
            code_des: None,
        }
    }

    fn error(err: &BasaltError) -> Self {
        Self {
            code: Code::Error,
            code_des: Some(err.to_string()),
        }
    }
}

/// Response of `CommitLength`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitLengthResponse {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_des: Option<String>,
    #[serde(default)]
    pub length: u32,
}

/// Framed head of a `ReadBlocks` response; payloads follow concatenated.
#[derive(Debug, Serialize, Deserialize)]
struct BlocksHead {
    code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_des: Option<String>,
    #[serde(default)]
    end: u32,
    #[serde(default)]
    lens: Vec<u32>,
}

/// Framed head of a `ReadEntries` response; payloads follow concatenated.
#[derive(Debug, Serialize, Deserialize)]
struct EntriesHead {
    code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_des: Option<String>,
    #[serde(default)]
    end: u32,
    #[serde(default)]
    entries: Vec<EntryMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    offset: u32,
    len: u32,
    crc: u32,
}

// ---------------------------------------------------------------------------
// Block framing: [count u32][len u32 x count][payloads]
// ---------------------------------------------------------------------------

/// Encode blocks for a binary request body.
pub fn encode_blocks(blocks: &[Block]) -> Bytes {
    let total: usize = blocks.iter().map(|b| b.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + blocks.len() * 4 + total);
    buf.extend_from_slice(&(blocks.len() as u32).to_be_bytes());
    for block in blocks {
        buf.extend_from_slice(&(block.len() as u32).to_be_bytes());
    }
    for block in blocks {
        buf.extend_from_slice(block);
    }
    buf.freeze()
}

/// Decode a binary block body.
pub fn decode_blocks(mut buf: Bytes) -> Result<Vec<Block>> {
    let short = || BasaltError::Serialization("truncated block body".to_string());

    if buf.remaining() < 4 {
        return Err(short());
    }
    let count = buf.get_u32() as usize;
    if buf.remaining() < count * 4 {
        return Err(short());
    }
    let mut lens = Vec::with_capacity(count);
    for _ in 0..count {
        lens.push(buf.get_u32() as usize);
    }

    let mut blocks = Vec::with_capacity(count);
    for len in lens {
        if buf.remaining() < len {
            return Err(short());
        }
        blocks.push(buf.split_to(len));
    }
    Ok(blocks)
}

fn frame_json<T: Serialize>(head: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(head)?;
    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

fn unframe_json<T: DeserializeOwned>(buf: &mut Bytes) -> Result<T> {
    if buf.remaining() < 4 {
        return Err(BasaltError::Serialization("truncated frame header".to_string()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(BasaltError::Serialization("truncated frame body".to_string()));
    }
    let head = buf.split_to(len);
    Ok(serde_json::from_slice(&head)?)
}

// ---------------------------------------------------------------------------
// Server surface
// ---------------------------------------------------------------------------

/// Build the node's RPC router.
pub fn router(node: Arc<ExtentNode>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/heartbeat", get(handle_heartbeat))
        .route("/extent/:id", post(handle_alloc))
        .route("/extent/:id/append", post(handle_append))
        .route("/extent/:id/replicate", post(handle_replicate))
        .route("/extent/:id/blocks", get(handle_read_blocks))
        .route("/extent/:id/entries", get(handle_read_entries))
        .route("/extent/:id/seal", post(handle_seal))
        .route("/extent/:id/commit_length", get(handle_commit_length))
        .route("/extent/:id/copy", get(handle_copy))
        .route("/recovery", post(handle_require_recovery))
        .with_state(node)
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_heartbeat(State(node): State<Arc<ExtentNode>>) -> Response {
    let beats = node
        .heartbeat_stream()
        .map(Ok::<_, Infallible>);
    Body::from_stream(beats).into_response()
}

#[derive(Deserialize)]
struct AppendQuery {
    /// Comma-separated secondary peer addresses.
    peers: String,
}

async fn handle_append(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
    Query(query): Query<AppendQuery>,
    body: Bytes,
) -> Json<WriteResponse> {
    let peers: Vec<String> = query
        .peers
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    let result = match decode_blocks(body) {
        Ok(blocks) => node.append(extent_id, &peers, blocks).await,
        Err(e) => Err(e),
    };
    match result {
        Ok((offsets, end)) => Json(WriteResponse::ok(offsets, end)),
        Err(e) => Json(WriteResponse::error(&e)),
    }
}

#[derive(Deserialize)]
struct ReplicateQuery {
    commit: u32,
}

async fn handle_replicate(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
    Query(query): Query<ReplicateQuery>,
    body: Bytes,
) -> Json<WriteResponse> {
    let result = match decode_blocks(body) {
        Ok(blocks) => node.replicate_blocks(extent_id, query.commit, blocks).await,
        Err(e) => Err(e),
    };
    match result {
        Ok((offsets, end)) => Json(WriteResponse::ok(offsets, end)),
        Err(e) => Json(WriteResponse::error(&e)),
    }
}

async fn handle_alloc(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
) -> Json<CodeResponse> {
    match node.alloc_extent(extent_id) {
        Ok(()) => Json(CodeResponse::ok()),
        Err(e) => Json(CodeResponse::error(&e)),
    }
}

#[derive(Deserialize)]
struct SealQuery {
    commit_length: u32,
}

async fn handle_seal(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
    Query(query): Query<SealQuery>,
) -> Json<CodeResponse> {
    match node.seal(extent_id, query.commit_length).await {
        Ok(()) => Json(CodeResponse::ok()),
        Err(e) => Json(CodeResponse::error(&e)),
    }
}

async fn handle_commit_length(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
) -> Json<CommitLengthResponse> {
    match node.commit_length_of(extent_id) {
        Ok(length) => Json(CommitLengthResponse {
            code: Code::Ok,
            code_des: None,
            length,
        }),
        Err(e) => Json(CommitLengthResponse {
            code: Code::Error,
            code_des: Some(e.to_string()),
            length: 0,
        }),
    }
}

#[derive(Deserialize)]
struct ReadBlocksQuery {
    offset: u32,
    count: u32,
}

async fn handle_read_blocks(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
    Query(query): Query<ReadBlocksQuery>,
) -> Response {
    let (head, payload) = match node.read_blocks(extent_id, query.offset, query.count) {
        Ok(result) => {
            let lens: Vec<u32> = result.blocks.iter().map(|b| b.len() as u32).collect();
            let mut payload = BytesMut::new();
            for block in &result.blocks {
                payload.extend_from_slice(block);
            }
            (
                BlocksHead {
                    code: result.code,
                    code_des: None,
                    end: result.end,
                    lens,
                },
                payload.freeze(),
            )
        }
        Err(e) => (
            BlocksHead {
                code: Code::Error,
                code_des: Some(e.to_string()),
                end: 0,
                lens: Vec::new(),
            },
            Bytes::new(),
        ),
    };
    framed_response(&head, payload)
}

#[derive(Deserialize)]
struct ReadEntriesQuery {
    offset: u32,
    #[serde(default)]
    replay: u32,
}

async fn handle_read_entries(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
    Query(query): Query<ReadEntriesQuery>,
) -> Response {
    let (head, payload) = match node.read_entries(extent_id, query.offset, query.replay != 0) {
        Ok(result) => {
            let metas: Vec<EntryMeta> = result
                .entries
                .iter()
                .map(|e| EntryMeta {
                    offset: e.offset,
                    len: e.data.len() as u32,
                    crc: e.crc,
                })
                .collect();
            let mut payload = BytesMut::new();
            for entry in &result.entries {
                payload.extend_from_slice(&entry.data);
            }
            (
                EntriesHead {
                    code: result.code,
                    code_des: None,
                    end: result.end,
                    entries: metas,
                },
                payload.freeze(),
            )
        }
        Err(e) => (
            EntriesHead {
                code: Code::Error,
                code_des: Some(e.to_string()),
                end: 0,
                entries: Vec::new(),
            },
            Bytes::new(),
        ),
    };
    framed_response(&head, payload)
}

async fn handle_copy(
    State(node): State<Arc<ExtentNode>>,
    Path(extent_id): Path<ExtentId>,
) -> Response {
    let copy = node.copy_extent(extent_id).await;
    let head = match frame_json(&copy.header) {
        Ok(head) => head,
        Err(e) => return error_response(&e),
    };
    let stream = stream::once(async move { Ok::<_, BasaltError>(head) }).chain(copy.body);
    Body::from_stream(stream).into_response()
}

async fn handle_require_recovery(
    State(node): State<Arc<ExtentNode>>,
    Json(task): Json<RecoveryTask>,
) -> Json<CodeResponse> {
    match node.require_recovery(task).await {
        Ok(()) => Json(CodeResponse::ok()),
        Err(e) => Json(CodeResponse::error(&e)),
    }
}

fn framed_response<T: Serialize>(head: &T, payload: Bytes) -> Response {
    match frame_json(head) {
        Ok(framed) => {
            let mut body = BytesMut::with_capacity(framed.len() + payload.len());
            body.extend_from_slice(&framed);
            body.extend_from_slice(&payload);
            body.freeze().into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &BasaltError) -> Response {
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Peer client
// ---------------------------------------------------------------------------

/// HTTP implementation of [`PeerClient`].
pub struct HttpPeer {
    base: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpPeer {
    pub fn new(addr: &str, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BasaltError::Network(e.to_string()))?;
        Ok(Self {
            base: format!("http://{}", addr),
            http,
            request_timeout,
        })
    }
}

fn net_err(e: reqwest::Error) -> BasaltError {
    BasaltError::Network(e.to_string())
}

fn peer_rejected(code_des: Option<String>) -> BasaltError {
    BasaltError::BadState(format!(
        "peer rejected request: {}",
        code_des.unwrap_or_else(|| "unknown".to_string())
    ))
}

#[async_trait]
impl PeerClient for HttpPeer {
    async fn replicate_blocks(
        &self,
        extent_id: ExtentId,
        commit: u32,
        blocks: Vec<Block>,
    ) -> Result<(Vec<u32>, u32)> {
        let url = format!(
            "{}/extent/{}/replicate?commit={}",
            self.base, extent_id, commit
        );
        let response: WriteResponse = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .body(encode_blocks(&blocks))
            .send()
            .await
            .map_err(net_err)?
            .json()
            .await
            .map_err(net_err)?;

        if response.code != Code::Ok {
            return Err(peer_rejected(response.code_des));
        }
        Ok((response.offsets, response.end))
    }

    async fn copy_extent(&self, extent_id: ExtentId) -> Result<CopyStream> {
        let url = format!("{}/extent/{}/copy", self.base, extent_id);
        // No per-request timeout: large extents legitimately stream for a
        // long time. Chunk progress is bounded by the connection itself.
        let response = self.http.get(url).send().await.map_err(net_err)?;
        if !response.status().is_success() {
            return Err(BasaltError::Network(format!(
                "copy stream rejected with status {}",
                response.status()
            )));
        }

        let mut raw = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(net_err))
            .boxed();
        let (header, leftover) = read_framed_header::<CopyHeader>(&mut raw).await?;

        let body = if leftover.is_empty() {
            raw
        } else {
            stream::once(async move { Ok(leftover) }).chain(raw).boxed()
        };
        Ok(CopyStream { header, body })
    }

    async fn read_entries(
        &self,
        extent_id: ExtentId,
        offset: u32,
        replay: bool,
    ) -> Result<ReadEntriesResult> {
        let url = format!(
            "{}/extent/{}/entries?offset={}&replay={}",
            self.base,
            extent_id,
            offset,
            u32::from(replay)
        );
        let mut body = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(net_err)?
            .bytes()
            .await
            .map_err(net_err)?;

        let head: EntriesHead = unframe_json(&mut body)?;
        if head.code == Code::Error {
            return Err(peer_rejected(head.code_des));
        }

        let mut entries = Vec::with_capacity(head.entries.len());
        for meta in &head.entries {
            if body.remaining() < meta.len as usize {
                return Err(BasaltError::Serialization(
                    "entry payload shorter than its header".to_string(),
                ));
            }
            entries.push(Entry {
                offset: meta.offset,
                data: body.split_to(meta.len as usize),
                crc: meta.crc,
            });
        }
        Ok(ReadEntriesResult {
            entries,
            end: head.end,
            code: head.code,
        })
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/health", self.base);
        matches!(
            self.http
                .get(url)
                .timeout(Duration::from_secs(2))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }
}

/// Accumulate stream chunks until the length-prefixed JSON header is
/// complete; returns the header and any payload bytes read past it.
async fn read_framed_header<T: DeserializeOwned>(
    stream: &mut BoxStream<'static, Result<Bytes>>,
) -> Result<(T, Bytes)> {
    let mut buf = BytesMut::new();
    loop {
        if buf.len() >= 4 {
            let need = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if buf.len() >= 4 + need {
                let mut frame = buf.split_to(4 + need).freeze();
                frame.advance(4);
                let head = serde_json::from_slice(&frame)?;
                return Ok((head, buf.freeze()));
            }
        }
        match stream.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => {
                return Err(BasaltError::Network(
                    "stream ended before its header".to_string(),
                ));
            }
        }
    }
}

/// [`Connector`] producing [`HttpPeer`] clients.
pub struct HttpConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Connector for HttpConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(HttpPeer::new(
            addr,
            self.connect_timeout,
            self.request_timeout,
        )?))
    }
}
