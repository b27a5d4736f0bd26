//! Request dispatch and the collaborator contracts it relies on.
//!
//! [`Handler::process`] turns one inbound line into exactly one operation on
//! either the [`Log`] or the [`Paxos`] collaborator and writes the outcome to
//! a [`ResponseSink`]. The handler itself owns no mutable state; clones share
//! the same collaborators and can run on any number of connections at once.

use std::{io, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::select;
use tracing::{debug, info};

use crate::{
    context::Context,
    error::Result,
    paxos::{AcceptMessage, NodeStatus, Promise},
    request::{
        AcceptRequest, GetRequest, PrepareRequest, PullRequest, PushRequest, Request,
        SetRequest, StatusRequest, TypedRequest,
    },
};

/// Acknowledgement written by every successful mutating command.
pub const RESPONSE_OK: &str = "ok";

/// A live tail of log values. `None` means the subscription ended normally;
/// `Some(Err(_))` means it failed.
pub type ValueStream = BoxStream<'static, Result<String>>;

/// Indexed storage of learned values.
#[async_trait]
pub trait Log: Send + Sync {
    /// Records `v` as the learned value of slot `n`. Repeating the same
    /// `(n, v)` is a no-op.
    async fn set(&self, ctx: &Context, n: u64, v: &str) -> Result<()>;

    /// Every value from index `n` up to the current head, in order.
    async fn get(&self, ctx: &Context, n: u64) -> Result<Vec<String>>;

    /// Values from index `n` onwards, including ones appended later, until
    /// `ctx` is cancelled.
    async fn pull(&self, ctx: &Context, n: u64) -> Result<ValueStream>;

    /// Index of the first slot that has not been learned yet.
    fn head(&self) -> u64;
}

/// The consensus engine as seen from the command layer.
#[async_trait]
pub trait Paxos: Send + Sync {
    /// Runs full agreement rounds until `v` occupies a log slot. Returns the
    /// messages chosen along the way.
    async fn commit(&self, ctx: &Context, v: &str) -> Result<Vec<AcceptMessage>>;

    async fn prepare(&self, ctx: &Context, n: u64) -> Promise;

    async fn accept(&self, ctx: &Context, n: u64, v: &str, id: &str) -> bool;

    /// Acknowledges locally that the proposal `id` has been learned.
    fn set(&self, id: &str);

    fn status(&self) -> NodeStatus;
}

/// One line received from a connection.
pub trait InboundMessage: Sync {
    fn message(&self) -> &str;
    fn address(&self) -> &str;
    fn name(&self) -> &str;
}

/// Where responses for a processed line go. `pull` pushes once per value.
#[async_trait]
pub trait ResponseSink: Send {
    async fn push(&mut self, payload: String) -> io::Result<()>;
}

#[async_trait]
impl ResponseSink for Vec<String> {
    async fn push(&mut self, payload: String) -> io::Result<()> {
        Vec::push(self, payload);
        Ok(())
    }
}

pub struct Handler<L: ?Sized, P: ?Sized> {
    log: Arc<L>,
    paxos: Arc<P>,
}

impl<L: ?Sized, P: ?Sized> Clone for Handler<L, P> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            paxos: Arc::clone(&self.paxos),
        }
    }
}

impl<L, P> Handler<L, P>
where
    L: Log + ?Sized,
    P: Paxos + ?Sized,
{
    pub fn new(log: Arc<L>, paxos: Arc<P>) -> Self {
        Self { log, paxos }
    }

    /// Parses, validates and dispatches one inbound line.
    ///
    /// Parse and build errors are returned before any collaborator is
    /// called. Collaborator errors are returned unchanged.
    pub async fn process<M, S>(&self, ctx: Context, message: &M, response: &mut S) -> Result<()>
    where
        M: InboundMessage + ?Sized,
        S: ResponseSink + ?Sized,
    {
        let request = Request::parse(message.message())?.with_context(ctx);
        let typed = TypedRequest::try_from(request)?;
        debug!(
            peer = message.address(),
            name = message.name(),
            cmd = %typed.cmd(),
            "dispatching request"
        );

        match typed {
            TypedRequest::Push(request) => self.push(request, response).await,
            TypedRequest::Get(request) => self.get(request, response).await,
            TypedRequest::Pull(request) => self.pull(request, response).await,
            TypedRequest::Status(request) => self.status(request, response).await,
            TypedRequest::Set(request) => self.set(request, response).await,
            TypedRequest::Prepare(request) => self.prepare(request, response).await,
            TypedRequest::Accept(request) => self.accept(request, response).await,
        }
    }

    /// Commits `v` through one consensus `commit` call. Retrying across
    /// proposal numbers happens inside the consensus engine, not here.
    pub async fn push<S>(&self, request: PushRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let chosen = self.paxos.commit(request.request.ctx(), &request.v).await?;
        info!(v = %request.v, rounds = chosen.len(), "value committed");
        response.push(RESPONSE_OK.to_string()).await?;
        Ok(())
    }

    pub async fn get<S>(&self, request: GetRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let values = self.log.get(request.request.ctx(), request.n).await?;
        response.push(values.join(" ")).await?;
        Ok(())
    }

    /// Streams values from index `n` until the request context is cancelled
    /// or the log closes the subscription.
    pub async fn pull<S>(&self, request: PullRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let ctx = request.request.ctx();
        let mut values = self.log.pull(ctx, request.n).await?;
        debug!(from = request.n, "pull subscription opened");

        loop {
            select! {
                biased;
                _ = ctx.cancelled() => {
                    debug!(from = request.n, "pull subscription cancelled");
                    return Ok(());
                }
                next = values.next() => match next {
                    Some(Ok(value)) => response.push(value).await?,
                    Some(Err(err)) => return Err(err),
                    None => {
                        debug!(from = request.n, "pull subscription closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    pub async fn status<S>(&self, _request: StatusRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let status = self.paxos.status();
        let payload = serde_json::to_string(&status)?;
        response.push(payload).await?;
        Ok(())
    }

    /// Learns `(n, id, v)`: stores `v` at slot `n` and lets the acceptor
    /// drop the matching accepted message.
    pub async fn set<S>(&self, request: SetRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        self.log
            .set(request.request.ctx(), request.n, &request.v)
            .await?;
        self.paxos.set(&request.id);
        response.push(RESPONSE_OK.to_string()).await?;
        Ok(())
    }

    pub async fn prepare<S>(&self, request: PrepareRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let promise = self.paxos.prepare(request.request.ctx(), request.n).await;
        response.push(promise.to_string()).await?;
        Ok(())
    }

    pub async fn accept<S>(&self, request: AcceptRequest, response: &mut S) -> Result<()>
    where
        S: ResponseSink + ?Sized,
    {
        let accepted = self
            .paxos
            .accept(request.request.ctx(), request.n, &request.v, &request.id)
            .await;
        response.push(accepted.to_string()).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{error::Error, log::MemoryLog};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn record(journal: &Journal, call: String) {
        journal.lock().unwrap().push(call);
    }

    struct RecordingLog {
        journal: Journal,
        values: Vec<String>,
    }

    #[async_trait]
    impl Log for RecordingLog {
        async fn set(&self, _ctx: &Context, n: u64, v: &str) -> Result<()> {
            record(&self.journal, format!("log.set {n} {v}"));
            Ok(())
        }

        async fn get(&self, _ctx: &Context, n: u64) -> Result<Vec<String>> {
            record(&self.journal, format!("log.get {n}"));
            Ok(self.values.iter().skip(n as usize).cloned().collect())
        }

        async fn pull(&self, _ctx: &Context, n: u64) -> Result<ValueStream> {
            record(&self.journal, format!("log.pull {n}"));
            let values: Vec<Result<String>> =
                self.values.iter().skip(n as usize).cloned().map(Ok).collect();
            Ok(stream::iter(values).boxed())
        }

        fn head(&self) -> u64 {
            self.values.len() as u64
        }
    }

    struct RecordingPaxos {
        journal: Journal,
        promise: Promise,
        accepts: bool,
        reachable: bool,
    }

    #[async_trait]
    impl Paxos for RecordingPaxos {
        async fn commit(&self, _ctx: &Context, v: &str) -> Result<Vec<AcceptMessage>> {
            record(&self.journal, format!("paxos.commit {v}"));
            if !self.reachable {
                return Err(Error::NoQuorum {
                    reason: "1 of 3 replicas answered".to_string(),
                });
            }
            Ok(vec![AcceptMessage::new(1, "0.a.1", v)])
        }

        async fn prepare(&self, _ctx: &Context, n: u64) -> Promise {
            record(&self.journal, format!("paxos.prepare {n}"));
            self.promise.clone()
        }

        async fn accept(&self, _ctx: &Context, n: u64, v: &str, id: &str) -> bool {
            record(&self.journal, format!("paxos.accept {n} {id} {v}"));
            self.accepts
        }

        fn set(&self, id: &str) {
            record(&self.journal, format!("paxos.set {id}"));
        }

        fn status(&self) -> NodeStatus {
            record(&self.journal, "paxos.status".to_string());
            NodeStatus {
                name: "127.0.0.1:7001".to_string(),
                replicas: 3,
                quorum: 2,
                promised: Some(4),
                accepted: None,
                head: 3,
            }
        }
    }

    struct Line(&'static str);

    impl InboundMessage for Line {
        fn message(&self) -> &str {
            self.0
        }

        fn address(&self) -> &str {
            "127.0.0.1:50000"
        }

        fn name(&self) -> &str {
            "conn-1"
        }
    }

    /// Forwards every payload so a test can observe a running `pull`.
    struct ChannelSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl ResponseSink for ChannelSink {
        async fn push(&mut self, payload: String) -> io::Result<()> {
            self.0
                .send(payload)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
        }
    }

    struct Fixture {
        journal: Journal,
        handler: Handler<RecordingLog, RecordingPaxos>,
    }

    fn fixture() -> Fixture {
        fixture_with(Promise::granted(None))
    }

    fn fixture_with(promise: Promise) -> Fixture {
        let journal = Journal::default();
        let log = RecordingLog {
            journal: Arc::clone(&journal),
            values: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        let paxos = RecordingPaxos {
            journal: Arc::clone(&journal),
            promise,
            accepts: false,
            reachable: true,
        };
        Fixture {
            journal,
            handler: Handler::new(Arc::new(log), Arc::new(paxos)),
        }
    }

    impl Fixture {
        async fn run(&self, line: &'static str) -> (Result<()>, Vec<String>) {
            let mut response = Vec::new();
            let result = self
                .handler
                .process(Context::background(), &Line(line), &mut response)
                .await;
            (result, response)
        }

        fn calls(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn every_command_dispatches_exactly_one_operation() {
        let cases = [
            ("push hello", "paxos.commit hello"),
            ("get 1", "log.get 1"),
            ("pull 2", "log.pull 2"),
            ("status", "paxos.status"),
            ("prepare 7", "paxos.prepare 7"),
            ("accept 7 0.b.7 hello", "paxos.accept 7 0.b.7 hello"),
        ];

        for (line, expected) in cases {
            let fixture = fixture();
            let (result, _) = fixture.run(line).await;
            assert!(result.is_ok(), "{line}: {result:?}");
            assert_eq!(fixture.calls(), [expected], "{line}");
        }
    }

    #[tokio::test]
    async fn push_acknowledges_after_commit() {
        let fixture = fixture();
        let (result, response) = fixture.run("push hello").await;

        result.unwrap();
        assert_eq!(response, ["ok"]);
    }

    #[tokio::test]
    async fn push_failure_is_returned_without_a_response() {
        let journal = Journal::default();
        let handler = Handler::new(
            Arc::new(RecordingLog {
                journal: Arc::clone(&journal),
                values: Vec::new(),
            }),
            Arc::new(RecordingPaxos {
                journal: Arc::clone(&journal),
                promise: Promise::refused(9, None),
                accepts: false,
                reachable: false,
            }),
        );

        let mut response = Vec::new();
        let err = handler
            .process(Context::background(), &Line("push hello"), &mut response)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoQuorum { .. }));
        assert!(response.is_empty());
        assert_eq!(*journal.lock().unwrap(), ["paxos.commit hello"]);
    }

    #[tokio::test]
    async fn get_writes_values_as_one_line() {
        let fixture = fixture();
        let (result, response) = fixture.run("get 1").await;

        result.unwrap();
        assert_eq!(response, ["b c"]);
    }

    #[tokio::test]
    async fn get_at_head_writes_an_empty_line() {
        let fixture = fixture();
        let (result, response) = fixture.run("get 3").await;

        result.unwrap();
        assert_eq!(response, [""]);
    }

    #[tokio::test]
    async fn pull_writes_one_line_per_value_until_the_stream_ends() {
        let fixture = fixture();
        let (result, response) = fixture.run("pull 0").await;

        result.unwrap();
        assert_eq!(response, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn status_is_json() {
        let fixture = fixture();
        let (result, response) = fixture.run("status extra words").await;

        result.unwrap();
        let status: serde_json::Value = serde_json::from_str(&response[0]).unwrap();
        assert_eq!(status["name"], "127.0.0.1:7001");
        assert_eq!(status["quorum"], 2);
        assert_eq!(status["head"], 3);
    }

    #[tokio::test]
    async fn set_stores_the_value_then_acknowledges_the_proposal() {
        let fixture = fixture();
        let (result, response) = fixture.run("set 3 3.b.4 hello").await;

        result.unwrap();
        assert_eq!(response, ["ok"]);
        assert_eq!(fixture.calls(), ["log.set 3 hello", "paxos.set 3.b.4"]);
    }

    #[tokio::test]
    async fn prepare_reports_the_accepted_message() {
        let fixture = fixture_with(Promise::granted(Some(AcceptMessage::new(4, "0.a.4", "x"))));
        let (result, response) = fixture.run("prepare 9").await;

        result.unwrap();
        assert_eq!(response, ["true 4 0.a.4 x"]);
    }

    #[tokio::test]
    async fn prepare_refusal_names_the_outranking_number() {
        let fixture = fixture_with(Promise::refused(12, None));
        let (result, response) = fixture.run("prepare 9").await;

        result.unwrap();
        assert_eq!(response, ["false 12"]);
    }

    #[tokio::test]
    async fn accept_reports_the_vote() {
        let fixture = fixture();
        let (result, response) = fixture.run("accept 1 0.a.1 v").await;

        result.unwrap();
        assert_eq!(response, ["false"]);
    }

    #[tokio::test]
    async fn malformed_lines_reach_no_collaborator() {
        let cases = [
            "",
            "push",
            "get",
            "get x",
            "pull -1",
            "prepare",
            "accept 1 id",
            "set 1 id",
            "set x id v",
            "frobnicate 1",
        ];

        for line in cases {
            let fixture = fixture();
            let (result, response) = fixture.run(line).await;
            let err = result.expect_err(line);
            assert!(err.is_malformed(), "{line}: {err:?}");
            assert!(response.is_empty(), "{line}");
            assert!(fixture.calls().is_empty(), "{line}");
        }
    }

    #[tokio::test]
    async fn unknown_commands_are_named_in_the_error() {
        let fixture = fixture();
        let (result, _) = fixture.run("frobnicate 1").await;

        assert!(matches!(result, Err(Error::UnknownCommand(cmd)) if cmd == "frobnicate"));
    }

    #[tokio::test]
    async fn repeated_set_is_idempotent_on_a_real_log() {
        let log = Arc::new(MemoryLog::new());
        let paxos = Arc::new(RecordingPaxos {
            journal: Journal::default(),
            promise: Promise::granted(None),
            accepts: true,
            reachable: true,
        });
        let handler = Handler::new(Arc::clone(&log), paxos);

        let mut response = Vec::new();
        for _ in 0..2 {
            handler
                .process(Context::background(), &Line("set 0 0.a.1 hello"), &mut response)
                .await
                .unwrap();
        }
        assert_eq!(response, ["ok", "ok"]);
        assert_eq!(log.get(&Context::background(), 0).await.unwrap(), ["hello"]);

        let err = handler
            .process(Context::background(), &Line("set 0 0.b.2 other"), &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { index: 0 }));
    }

    #[tokio::test]
    async fn pull_delivers_values_appended_after_it_started() {
        let log = Arc::new(MemoryLog::new());
        let background = Context::background();
        log.set(&background, 0, "a").await.unwrap();

        let paxos = Arc::new(RecordingPaxos {
            journal: Journal::default(),
            promise: Promise::granted(None),
            accepts: true,
            reachable: true,
        });
        let handler = Handler::new(Arc::clone(&log), paxos);
        let (ctx, cancel) = Context::with_cancel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut sink = ChannelSink(tx);
            handler.process(ctx, &Line("pull 0"), &mut sink).await
        });

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        log.set(&background, 1, "b").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("b"));

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
