//! NNTP reader session and bounded-retry fetch operations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NntpError {
    #[error("temporary server error: {code} {reply}")]
    Transient { code: u16, reply: String },
    #[error("server rejected request: {code} {reply}")]
    Permanent { code: u16, reply: String },
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("article {article}: gave up after {attempts} attempts")]
    Exhausted { article: u64, attempts: u32 },
    #[error(transparent)]
    Nntp(#[from] NntpError),
}

#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub name: String,
    pub last: u64,
    pub first: u64,
    pub flags: String,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub count: u64,
    pub first: u64,
    pub last: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ArticleStat {
    pub number: u64,
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct RawArticle {
    pub number: u64,
    pub message_id: String,
    pub lines: Vec<Vec<u8>>,
}

/// The seam between orchestration and the wire protocol.
#[async_trait]
pub trait ArticleSource {
    async fn list(&mut self) -> Result<Vec<GroupEntry>, NntpError>;
    async fn group(&mut self, name: &str) -> Result<GroupStatus, NntpError>;
    async fn stat(&mut self, number: u64) -> Result<ArticleStat, NntpError>;
    async fn article(&mut self, number: u64) -> Result<RawArticle, NntpError>;
    async fn quit(&mut self) -> Result<(), NntpError>;
}

pub struct NntpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NntpSession {
    pub async fn connect(host: &str, port: u16) -> Result<Self, NntpError> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read, write) = stream.into_split();
        let mut session = Self {
            reader: BufReader::new(read),
            writer: write,
        };
        let (code, reply) = read_status(&mut session.reader).await?;
        if code != 200 && code != 201 {
            return Err(classify(code, reply));
        }
        debug!("connected to {host}:{port}: {reply}");
        Ok(session)
    }

    async fn command(&mut self, command: &str) -> Result<(u16, String), NntpError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        read_status(&mut self.reader).await
    }

    async fn expect(&mut self, command: &str, code: u16) -> Result<String, NntpError> {
        let (got, reply) = self.command(command).await?;
        if got != code {
            return Err(classify(got, reply));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ArticleSource for NntpSession {
    async fn list(&mut self) -> Result<Vec<GroupEntry>, NntpError> {
        self.expect("LIST", 215).await?;
        let lines = read_multiline(&mut self.reader).await?;
        let mut groups = Vec::new();
        for line in lines {
            let text = String::from_utf8_lossy(&line);
            match parse_list_line(&text) {
                Some(entry) => groups.push(entry),
                None => warn!("skipping malformed LIST line: {text}"),
            }
        }
        Ok(groups)
    }

    async fn group(&mut self, name: &str) -> Result<GroupStatus, NntpError> {
        let reply = self.expect(&format!("GROUP {name}"), 211).await?;
        parse_group_reply(&reply)
    }

    async fn stat(&mut self, number: u64) -> Result<ArticleStat, NntpError> {
        let reply = self.expect(&format!("STAT {number}"), 223).await?;
        parse_stat_reply(&reply)
    }

    async fn article(&mut self, number: u64) -> Result<RawArticle, NntpError> {
        let reply = self.expect(&format!("ARTICLE {number}"), 220).await?;
        let stat = parse_stat_reply(&reply)?;
        let lines = read_multiline(&mut self.reader).await?;
        Ok(RawArticle {
            number: stat.number,
            message_id: stat.message_id,
            lines,
        })
    }

    async fn quit(&mut self) -> Result<(), NntpError> {
        self.expect("QUIT", 205).await?;
        Ok(())
    }
}

async fn read_line_bytes<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, NntpError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(NntpError::UnexpectedReply("connection closed".to_string()));
    }
    while matches!(line.last(), Some(b'\r' | b'\n')) {
        line.pop();
    }
    Ok(line)
}

async fn read_status<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<(u16, String), NntpError> {
    let line = read_line_bytes(reader).await?;
    let text = String::from_utf8_lossy(&line).into_owned();
    let code = text
        .get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| NntpError::UnexpectedReply(text.clone()))?;
    let reply = text.get(3..).unwrap_or("").trim().to_string();
    Ok((code, reply))
}

/// Reads a dot-terminated block, undoing dot-stuffing.
async fn read_multiline<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<Vec<u8>>, NntpError> {
    let mut lines = Vec::new();
    loop {
        let mut line = read_line_bytes(reader).await?;
        if line == b"." {
            return Ok(lines);
        }
        if line.starts_with(b"..") {
            line.remove(0);
        }
        lines.push(line);
    }
}

fn classify(code: u16, reply: String) -> NntpError {
    match code {
        400..=499 => NntpError::Transient { code, reply },
        500..=599 => NntpError::Permanent { code, reply },
        _ => NntpError::UnexpectedReply(format!("{code} {reply}")),
    }
}

fn parse_list_line(line: &str) -> Option<GroupEntry> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?.to_string();
    let last = parts.next()?.parse().ok()?;
    let first = parts.next()?.parse().ok()?;
    let flags = parts.next().unwrap_or("").to_string();
    Some(GroupEntry {
        name,
        last,
        first,
        flags,
    })
}

fn parse_group_reply(reply: &str) -> Result<GroupStatus, NntpError> {
    let mut parts = reply.split_whitespace();
    let mut next_number = || -> Option<u64> { parts.next()?.parse().ok() };
    let (Some(count), Some(first), Some(last)) = (next_number(), next_number(), next_number())
    else {
        return Err(NntpError::UnexpectedReply(reply.to_string()));
    };
    let name = parts.next().unwrap_or("").to_string();
    Ok(GroupStatus {
        count,
        first,
        last,
        name,
    })
}

fn parse_stat_reply(reply: &str) -> Result<ArticleStat, NntpError> {
    let mut parts = reply.split_whitespace();
    let number = parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| NntpError::UnexpectedReply(reply.to_string()))?;
    let message_id = parts
        .next()
        .ok_or_else(|| NntpError::UnexpectedReply(reply.to_string()))?
        .to_string();
    Ok(ArticleStat { number, message_id })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Nntp,
    Db,
    Mbox,
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventTarget::Nntp => "nntp",
            EventTarget::Db => "db",
            EventTarget::Mbox => "mbox",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Stat,
    Get,
    Queue,
    Skip,
    Store,
    Fail,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventAction::Stat => "STAT",
            EventAction::Get => "GET",
            EventAction::Queue => "QUEUE",
            EventAction::Skip => "SKIP",
            EventAction::Store => "STORE",
            EventAction::Fail => "FAIL",
        })
    }
}

/// Advisory progress record; never affects control flow.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub target: EventTarget,
    pub action: EventAction,
    pub number: u64,
    pub requested: u64,
    pub message_id: String,
}

pub trait StatusSink: Send + Sync {
    fn event(&self, event: &SyncEvent);
    fn progress(&self, _percent: u8) {}
}

pub struct NullSink;

impl StatusSink for NullSink {
    fn event(&self, _event: &SyncEvent) {}
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    /// Skip the courtesy sleeps between attempts.
    pub aggressive: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_secs(5),
            aggressive: false,
        }
    }
}

pub struct Fetcher<S> {
    source: S,
    policy: RetryPolicy,
    sink: Arc<dyn StatusSink>,
}

impl<S: ArticleSource + Send> Fetcher<S> {
    pub fn new(source: S, policy: RetryPolicy, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            source,
            policy,
            sink,
        }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub async fn stat(&mut self, number: u64) -> Result<ArticleStat, FetchError> {
        for attempt in 1..=self.policy.attempts {
            match self.source.stat(number).await {
                Ok(stat) => {
                    self.sink.event(&SyncEvent {
                        target: EventTarget::Nntp,
                        action: EventAction::Stat,
                        number: stat.number,
                        requested: number,
                        message_id: stat.message_id.clone(),
                    });
                    return Ok(stat);
                }
                Err(NntpError::Transient { code, reply }) => {
                    warn!(article = number, attempt, code, "temporary error: {reply}");
                    if !self.policy.aggressive {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(
            article = number,
            "failed to stat after {} attempts", self.policy.attempts
        );
        Err(FetchError::Exhausted {
            article: number,
            attempts: self.policy.attempts,
        })
    }

    pub async fn get(&mut self, number: u64) -> Result<RawArticle, FetchError> {
        for attempt in 1..=self.policy.attempts {
            match self.source.article(number).await {
                Ok(article) => {
                    self.sink.event(&SyncEvent {
                        target: EventTarget::Nntp,
                        action: EventAction::Get,
                        number: article.number,
                        requested: number,
                        message_id: article.message_id.clone(),
                    });
                    return Ok(article);
                }
                Err(NntpError::Transient { code, reply }) => {
                    warn!(article = number, attempt, code, "temporary error: {reply}");
                    if !self.policy.aggressive {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        warn!(
            article = number,
            "failed to download after {} attempts", self.policy.attempts
        );
        Err(FetchError::Exhausted {
            article: number,
            attempts: self.policy.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::io::BufReader;

    use super::{
        ArticleSource, ArticleStat, EventAction, FetchError, Fetcher, GroupEntry, GroupStatus,
        NntpError, RawArticle, RetryPolicy, StatusSink, SyncEvent, classify, parse_group_reply,
        parse_list_line, parse_stat_reply, read_multiline, read_status,
    };

    struct ScriptedSource {
        replies: VecDeque<Result<RawArticle, NntpError>>,
        calls: u32,
    }

    #[async_trait]
    impl ArticleSource for ScriptedSource {
        async fn list(&mut self) -> Result<Vec<GroupEntry>, NntpError> {
            Ok(Vec::new())
        }

        async fn group(&mut self, _name: &str) -> Result<GroupStatus, NntpError> {
            Err(NntpError::UnexpectedReply("not scripted".to_string()))
        }

        async fn stat(&mut self, number: u64) -> Result<ArticleStat, NntpError> {
            self.article(number).await.map(|a| ArticleStat {
                number: a.number,
                message_id: a.message_id,
            })
        }

        async fn article(&mut self, _number: u64) -> Result<RawArticle, NntpError> {
            self.calls += 1;
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(NntpError::UnexpectedReply("script over".to_string())))
        }

        async fn quit(&mut self) -> Result<(), NntpError> {
            Ok(())
        }
    }

    struct RecordingSink(Mutex<Vec<SyncEvent>>);

    impl StatusSink for RecordingSink {
        fn event(&self, event: &SyncEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn transient() -> NntpError {
        NntpError::Transient {
            code: 400,
            reply: "try again".to_string(),
        }
    }

    fn raw(number: u64) -> RawArticle {
        RawArticle {
            number,
            message_id: format!("<msg{number}@example.org>"),
            lines: vec![b"Subject: x".to_vec()],
        }
    }

    fn aggressive() -> RetryPolicy {
        RetryPolicy {
            aggressive: true,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let source = ScriptedSource {
            replies: VecDeque::from([Err(transient()), Ok(raw(42))]),
            calls: 0,
        };
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut fetcher = Fetcher::new(source, aggressive(), sink.clone());

        let article = fetcher.get(42).await.unwrap();
        assert_eq!(article.number, 42);
        assert_eq!(fetcher.source_mut().calls, 2);

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::Get);
        assert_eq!(events[0].requested, 42);
    }

    #[tokio::test]
    async fn repeated_transient_failures_exhaust_retries() {
        let source = ScriptedSource {
            replies: VecDeque::from([Err(transient()), Err(transient())]),
            calls: 0,
        };
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut fetcher = Fetcher::new(source, aggressive(), sink);

        let err = fetcher.get(42).await.unwrap_err();
        match err {
            FetchError::Exhausted { article, attempts } => {
                assert_eq!(article, 42);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected exhaustion, got {other}"),
        }
        assert_eq!(fetcher.source_mut().calls, 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let source = ScriptedSource {
            replies: VecDeque::from([Err(NntpError::Permanent {
                code: 500,
                reply: "no".to_string(),
            })]),
            calls: 0,
        };
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut fetcher = Fetcher::new(source, aggressive(), sink);

        let err = fetcher.stat(7).await.unwrap_err();
        assert!(matches!(err, FetchError::Nntp(NntpError::Permanent { .. })));
        assert_eq!(fetcher.source_mut().calls, 1);
    }

    #[tokio::test]
    async fn read_status_splits_code_and_reply() {
        let mut reader = BufReader::new(&b"223 17 <a@x> article exists\r\n"[..]);
        let (code, reply) = read_status(&mut reader).await.unwrap();
        assert_eq!(code, 223);
        assert_eq!(reply, "17 <a@x> article exists");
    }

    #[tokio::test]
    async fn read_multiline_unstuffs_dots() {
        let mut reader = BufReader::new(&b"Header: v\r\n\r\n..leading dot\r\n.\r\n"[..]);
        let lines = read_multiline(&mut reader).await.unwrap();
        assert_eq!(
            lines,
            vec![b"Header: v".to_vec(), Vec::new(), b".leading dot".to_vec()]
        );
    }

    #[test]
    fn classify_splits_transient_and_permanent() {
        assert!(matches!(
            classify(423, String::new()),
            NntpError::Transient { .. }
        ));
        assert!(matches!(
            classify(502, String::new()),
            NntpError::Permanent { .. }
        ));
        assert!(matches!(
            classify(223, String::new()),
            NntpError::UnexpectedReply(_)
        ));
    }

    #[test]
    fn group_reply_parses_counters() {
        let status = parse_group_reply("1234 3000234 3002322 misc.test").unwrap();
        assert_eq!(status.count, 1234);
        assert_eq!(status.first, 3000234);
        assert_eq!(status.last, 3002322);
        assert_eq!(status.name, "misc.test");
    }

    #[test]
    fn stat_reply_parses_number_and_id() {
        let stat = parse_stat_reply("17 <45223423@example.com> article retrieved").unwrap();
        assert_eq!(stat.number, 17);
        assert_eq!(stat.message_id, "<45223423@example.com>");
    }

    #[test]
    fn list_line_parses_group_entry() {
        let entry = parse_list_line("misc.test 3002322 3000234 y").unwrap();
        assert_eq!(entry.name, "misc.test");
        assert_eq!(entry.last, 3002322);
        assert_eq!(entry.first, 3000234);
        assert_eq!(entry.flags, "y");
    }
}
