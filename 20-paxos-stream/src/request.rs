//! Raw line parsing and the typed request builders.
//!
//! [`Request::parse`] splits a line into a [`Command`] and its arguments.
//! Each typed request wraps the base [`Request`] and decodes the fields its
//! command needs. Builders never perform I/O, so a malformed line is always
//! rejected before the log or the consensus engine sees it.

use crate::{
    command::Command,
    context::Context,
    error::{Error, Result},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A parsed but not yet typed command line.
#[derive(Debug, Clone)]
pub struct Request {
    ctx: Context,
    cmd: Command,
    args: Vec<String>,
}

impl Request {
    /// Splits `message` into a command token and whitespace-separated
    /// arguments.
    ///
    /// A command without arguments yields an empty argument list rather
    /// than a single empty-string argument.
    pub fn parse(message: &str) -> Result<Self> {
        let line = message.trim_end_matches(LINE_ENDINGS).trim_start();
        if line.trim_end().is_empty() {
            return Err(Error::IncorrectCommand);
        }

        let (token, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let cmd = token.parse::<Command>()?;
        let args = rest.split_whitespace().map(str::to_string).collect();

        Ok(Self {
            ctx: Context::background(),
            cmd,
            args,
        })
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn cmd(&self) -> Command {
        self.cmd
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn ensure_cmd(&self, cmd: Command) -> Result<()> {
        if self.cmd == cmd {
            Ok(())
        } else {
            Err(Error::IncorrectCommand)
        }
    }

    fn require_at_least(&self, count: usize) -> Result<()> {
        if self.args.len() >= count {
            Ok(())
        } else {
            Err(Error::IncorrectCommand)
        }
    }

    fn require_exactly(&self, count: usize) -> Result<()> {
        if self.args.len() == count {
            Ok(())
        } else {
            Err(Error::IncorrectCommand)
        }
    }

    fn int_arg(&self, position: usize) -> Result<u64> {
        let arg = self.args.get(position).ok_or(Error::IncorrectCommand)?;
        arg.parse().map_err(|source| Error::Decode {
            arg: arg.clone(),
            source,
        })
    }

    fn str_arg(&self, position: usize) -> Result<String> {
        self.args.get(position).cloned().ok_or(Error::IncorrectCommand)
    }
}

/// `push <v>`
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub request: Request,
    pub v: String,
}

impl TryFrom<Request> for PushRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Push)?;
        request.require_at_least(1)?;
        let v = request.str_arg(0)?;
        Ok(Self { request, v })
    }
}

/// `get <n>`
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub request: Request,
    pub n: u64,
}

impl TryFrom<Request> for GetRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Get)?;
        request.require_at_least(1)?;
        let n = request.int_arg(0)?;
        Ok(Self { request, n })
    }
}

/// `pull <n>`
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub request: Request,
    pub n: u64,
}

impl TryFrom<Request> for PullRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Pull)?;
        request.require_at_least(1)?;
        let n = request.int_arg(0)?;
        Ok(Self { request, n })
    }
}

/// `status`
#[derive(Debug, Clone)]
pub struct StatusRequest {
    pub request: Request,
}

impl TryFrom<Request> for StatusRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Status)?;
        Ok(Self { request })
    }
}

/// `prepare <n>`
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub request: Request,
    pub n: u64,
}

impl TryFrom<Request> for PrepareRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Prepare)?;
        request.require_at_least(1)?;
        let n = request.int_arg(0)?;
        Ok(Self { request, n })
    }
}

/// `accept <n> <id> <v>`
#[derive(Debug, Clone)]
pub struct AcceptRequest {
    pub request: Request,
    pub n: u64,
    pub id: String,
    pub v: String,
}

impl TryFrom<Request> for AcceptRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Accept)?;
        request.require_exactly(3)?;
        let n = request.int_arg(0)?;
        let id = request.str_arg(1)?;
        let v = request.str_arg(2)?;
        Ok(Self { request, n, id, v })
    }
}

/// `set <n> <id> <v>`, the learn step for log slot `n`.
#[derive(Debug, Clone)]
pub struct SetRequest {
    pub request: Request,
    pub n: u64,
    pub id: String,
    pub v: String,
}

impl TryFrom<Request> for SetRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        request.ensure_cmd(Command::Set)?;
        request.require_exactly(3)?;
        let n = request.int_arg(0)?;
        let id = request.str_arg(1)?;
        let v = request.str_arg(2)?;
        Ok(Self { request, n, id, v })
    }
}

/// A request after it has been checked and decoded, ready for dispatch.
#[derive(Debug, Clone)]
pub enum TypedRequest {
    Push(PushRequest),
    Get(GetRequest),
    Pull(PullRequest),
    Status(StatusRequest),
    Prepare(PrepareRequest),
    Accept(AcceptRequest),
    Set(SetRequest),
}

impl TryFrom<Request> for TypedRequest {
    type Error = Error;

    fn try_from(request: Request) -> Result<Self> {
        Ok(match request.cmd() {
            Command::Push => TypedRequest::Push(request.try_into()?),
            Command::Get => TypedRequest::Get(request.try_into()?),
            Command::Pull => TypedRequest::Pull(request.try_into()?),
            Command::Status => TypedRequest::Status(request.try_into()?),
            Command::Prepare => TypedRequest::Prepare(request.try_into()?),
            Command::Accept => TypedRequest::Accept(request.try_into()?),
            Command::Set => TypedRequest::Set(request.try_into()?),
        })
    }
}

impl TypedRequest {
    pub fn cmd(&self) -> Command {
        self.base().cmd()
    }

    pub fn ctx(&self) -> &Context {
        self.base().ctx()
    }

    fn base(&self) -> &Request {
        match self {
            TypedRequest::Push(req) => &req.request,
            TypedRequest::Get(req) => &req.request,
            TypedRequest::Pull(req) => &req.request,
            TypedRequest::Status(req) => &req.request,
            TypedRequest::Prepare(req) => &req.request,
            TypedRequest::Accept(req) => &req.request,
            TypedRequest::Set(req) => &req.request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Request {
        Request::parse(line).expect("line should parse")
    }

    #[test]
    fn parses_push_with_single_argument() {
        let request = parse("push val1");
        assert_eq!(request.cmd(), Command::Push);
        assert_eq!(request.args(), ["val1"]);
    }

    #[test]
    fn strips_line_endings_and_extra_whitespace() {
        let request = parse("accept  4\tnode-a  hello\r\n");
        assert_eq!(request.cmd(), Command::Accept);
        assert_eq!(request.args(), ["4", "node-a", "hello"]);
    }

    #[test]
    fn bare_command_has_no_arguments() {
        let request = parse("status");
        assert!(request.args().is_empty());
        let request = parse("push\n");
        assert!(request.args().is_empty());
    }

    #[test]
    fn empty_lines_are_incorrect() {
        assert!(matches!(Request::parse(""), Err(Error::IncorrectCommand)));
        assert!(matches!(Request::parse("   "), Err(Error::IncorrectCommand)));
        assert!(matches!(Request::parse("\r\n"), Err(Error::IncorrectCommand)));
    }

    #[test]
    fn unrecognised_token_is_unknown() {
        assert!(matches!(
            Request::parse("append x"),
            Err(Error::UnknownCommand(token)) if token == "append"
        ));
    }

    #[test]
    fn push_takes_first_argument_as_value() {
        let push = PushRequest::try_from(parse("push hello world")).unwrap();
        assert_eq!(push.v, "hello");
    }

    #[test]
    fn push_without_value_is_incorrect() {
        assert!(matches!(
            PushRequest::try_from(parse("push")),
            Err(Error::IncorrectCommand)
        ));
    }

    #[test]
    fn numeric_fields_must_decode() {
        assert!(matches!(
            GetRequest::try_from(parse("get abc")),
            Err(Error::Decode { arg, .. }) if arg == "abc"
        ));
        assert!(matches!(
            PullRequest::try_from(parse("pull 1.5")),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            PrepareRequest::try_from(parse("prepare -3")),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            SetRequest::try_from(parse("set x id v")),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn index_commands_decode_n() {
        assert_eq!(GetRequest::try_from(parse("get 12")).unwrap().n, 12);
        assert_eq!(PullRequest::try_from(parse("pull 0")).unwrap().n, 0);
        assert_eq!(PrepareRequest::try_from(parse("prepare 9")).unwrap().n, 9);
    }

    #[test]
    fn accept_and_set_need_exactly_three_arguments() {
        for line in ["accept 1 id", "accept 1 id v extra", "accept"] {
            assert!(matches!(
                AcceptRequest::try_from(parse(line)),
                Err(Error::IncorrectCommand)
            ));
        }
        for line in ["set 1", "set 1 id v extra"] {
            assert!(matches!(
                SetRequest::try_from(parse(line)),
                Err(Error::IncorrectCommand)
            ));
        }

        let accept = AcceptRequest::try_from(parse("accept 7 0.a.7 hello")).unwrap();
        assert_eq!((accept.n, accept.id.as_str(), accept.v.as_str()), (7, "0.a.7", "hello"));
        let set = SetRequest::try_from(parse("set 2 2.b.5 world")).unwrap();
        assert_eq!((set.n, set.id.as_str(), set.v.as_str()), (2, "2.b.5", "world"));
    }

    #[test]
    fn builders_reject_foreign_commands() {
        assert!(matches!(
            GetRequest::try_from(parse("pull 1")),
            Err(Error::IncorrectCommand)
        ));
        assert!(matches!(
            StatusRequest::try_from(parse("push v")),
            Err(Error::IncorrectCommand)
        ));
        assert!(matches!(
            SetRequest::try_from(parse("accept 1 id v")),
            Err(Error::IncorrectCommand)
        ));
    }

    #[test]
    fn typed_request_routes_by_command() {
        let typed = TypedRequest::try_from(parse("status")).unwrap();
        assert!(matches!(typed, TypedRequest::Status(_)));
        assert_eq!(typed.cmd(), Command::Status);

        let typed = TypedRequest::try_from(parse("set 0 0.a.1 v")).unwrap();
        assert!(matches!(typed, TypedRequest::Set(SetRequest { n: 0, .. })));
    }
}
