//! Protocol message types.
//!
//! Every message travels as a single line: `<length> <KIND> <field> <field> ...`. The length is
//! the zero-padded decimal byte length of the whole line, prefix included. Fields are positional
//! and their meaning depends on the kind, the typed payloads below give them names.

use std::{
    borrow::Cow,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use crate::core::{
    error::{ParseError, PayloadError},
    node::Role,
};

/// The minimum width of the length prefix.
const LENGTH_PREFIX_WIDTH: usize = 4;

/// The address reported by a SER_SUPER_PEER_OK when no super-peer could be found.
pub const NOT_FOUND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Message kinds, each maps to a wire keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Registers with the bootstrap server.
    Register,
    RegisterOk,
    /// Unregisters from the bootstrap server.
    Unregister,
    UnregisterOk,
    /// Joins a node's unstructured neighbour set.
    Join,
    JoinOk,
    /// Leaves the overlay.
    Leave,
    LeaveOk,
    /// Searches for a named resource.
    Search,
    SearchOk,
    /// Searches for a reachable super-peer.
    SuperPeerSearch,
    SuperPeerSearchOk,
    /// Liveness check between overlay nodes.
    Heartbeat,
    HeartbeatOk,
    /// Attaches to a super-peer, either as an ordinary peer or as a backbone member.
    JoinSuperPeer,
    JoinSuperPeerOk,
    /// Requests the recipient's owned resource names.
    ListResources,
    ListResourcesOk,
    /// Transport-level reachability check.
    Echo,
    EchoOk,
}

impl MessageKind {
    pub const ALL: [MessageKind; 20] = [
        MessageKind::Register,
        MessageKind::RegisterOk,
        MessageKind::Unregister,
        MessageKind::UnregisterOk,
        MessageKind::Join,
        MessageKind::JoinOk,
        MessageKind::Leave,
        MessageKind::LeaveOk,
        MessageKind::Search,
        MessageKind::SearchOk,
        MessageKind::SuperPeerSearch,
        MessageKind::SuperPeerSearchOk,
        MessageKind::Heartbeat,
        MessageKind::HeartbeatOk,
        MessageKind::JoinSuperPeer,
        MessageKind::JoinSuperPeerOk,
        MessageKind::ListResources,
        MessageKind::ListResourcesOk,
        MessageKind::Echo,
        MessageKind::EchoOk,
    ];

    /// Returns the wire keyword for this kind.
    pub fn keyword(&self) -> &'static str {
        match self {
            MessageKind::Register => "REG",
            MessageKind::RegisterOk => "REG_OK",
            MessageKind::Unregister => "UNREG",
            MessageKind::UnregisterOk => "UNREG_OK",
            MessageKind::Join => "JOIN",
            MessageKind::JoinOk => "JOIN_OK",
            MessageKind::Leave => "LEAVE",
            MessageKind::LeaveOk => "LEAVE_OK",
            MessageKind::Search => "SER",
            MessageKind::SearchOk => "SER_OK",
            MessageKind::SuperPeerSearch => "SER_SUPER_PEER",
            MessageKind::SuperPeerSearchOk => "SER_SUPER_PEER_OK",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::HeartbeatOk => "HEARTBEAT_OK",
            MessageKind::JoinSuperPeer => "JOIN_SUPER_PEER",
            MessageKind::JoinSuperPeerOk => "JOIN_SUPER_PEER_OK",
            MessageKind::ListResources => "LIST_RESOURCES",
            MessageKind::ListResourcesOk => "LIST_RESOURCES_OK",
            MessageKind::Echo => "ECHO",
            MessageKind::EchoOk => "ECHO_OK",
        }
    }

    /// Resolves a wire keyword to its kind.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.keyword() == keyword)
    }

    /// Returns `true` for the reply kinds (the `_OK` variants).
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::RegisterOk
                | MessageKind::UnregisterOk
                | MessageKind::JoinOk
                | MessageKind::LeaveOk
                | MessageKind::SearchOk
                | MessageKind::SuperPeerSearchOk
                | MessageKind::HeartbeatOk
                | MessageKind::JoinSuperPeerOk
                | MessageKind::ListResourcesOk
                | MessageKind::EchoOk
        )
    }

    /// Returns `true` for the kinds handled by the router's protocol state machine.
    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            MessageKind::Search | MessageKind::SuperPeerSearch | MessageKind::Heartbeat
        )
    }

    /// Returns the index of the hop count field, if the kind carries one.
    pub fn hop_count_index(&self) -> Option<usize> {
        match self {
            MessageKind::Search => Some(Search::HOPS),
            MessageKind::SuperPeerSearch => Some(SuperPeerSearch::HOPS),
            _ => None,
        }
    }

    /// Returns the number of fields this kind's schema allows.
    pub fn arity(&self) -> Arity {
        match self {
            MessageKind::Register | MessageKind::Unregister => Arity::Exact(3),
            MessageKind::RegisterOk => Arity::AtLeast(1),
            MessageKind::UnregisterOk | MessageKind::LeaveOk => Arity::Exact(1),
            MessageKind::Join | MessageKind::Leave => Arity::Exact(2),
            MessageKind::JoinOk | MessageKind::JoinSuperPeerOk => Arity::AtLeast(1),
            MessageKind::Search => Arity::Exact(4),
            MessageKind::SearchOk => Arity::AtLeast(4),
            MessageKind::SuperPeerSearch => Arity::Exact(3),
            MessageKind::SuperPeerSearchOk => Arity::Exact(2),
            MessageKind::Heartbeat | MessageKind::HeartbeatOk => Arity::Exact(2),
            MessageKind::JoinSuperPeer => Arity::Exact(3),
            MessageKind::ListResources => Arity::Exact(2),
            MessageKind::ListResourcesOk => Arity::AtLeast(3),
            MessageKind::Echo | MessageKind::EchoOk => Arity::Exact(0),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// The number of fields a message kind carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// A wire message: a kind and its positional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    fields: Vec<String>,
}

impl Message {
    /// Creates a new message, the fields aren't checked against the kind's schema.
    pub fn new(kind: MessageKind, fields: Vec<String>) -> Self {
        Self { kind, fields }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Replaces a field, returning `false` if the index is out of bounds.
    pub fn set_field(&mut self, index: usize, value: impl Into<String>) -> bool {
        match self.fields.get_mut(index) {
            Some(field) => {
                *field = value.into();
                true
            }
            None => false,
        }
    }

    /// Returns the hop count, if the kind carries one and it is numeric.
    pub fn hop_count(&self) -> Option<u32> {
        self.kind
            .hop_count_index()
            .and_then(|i| self.field(i))
            .and_then(|hops| hops.parse().ok())
    }

    /// Increments the hop count field in place and returns the new value.
    pub fn increment_hop_count(&mut self) -> Option<u32> {
        let index = self.kind.hop_count_index()?;
        let hops = self.hop_count()?.saturating_add(1);
        self.set_field(index, hops.to_string());

        Some(hops)
    }

    /// Returns the query carried by a SER message.
    pub fn search_query(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Search => self.field(Search::QUERY),
            _ => None,
        }
    }

    /// Encodes the message into its single-line wire form.
    pub fn serialize(&self) -> String {
        let mut body = String::from(self.kind.keyword());
        for field in &self.fields {
            body.push(' ');
            body.push_str(&quote(field));
        }

        // The prefix counts itself, widen it if the line outgrows four digits.
        let mut width = LENGTH_PREFIX_WIDTH;
        while (body.len() + width + 1).to_string().len() > width {
            width += 1;
        }
        let len = body.len() + width + 1;

        format!("{len:0width$} {body}")
    }

    /// Decodes a single wire line, a trailing line terminator is ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = line.split_once(' ').unwrap_or((line, ""));
        if prefix.len() < LENGTH_PREFIX_WIDTH || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidLength(prefix.to_owned()));
        }
        let declared: usize = prefix
            .parse()
            .map_err(|_| ParseError::InvalidLength(prefix.to_owned()))?;
        if declared != line.len() {
            return Err(ParseError::LengthMismatch {
                declared,
                actual: line.len(),
            });
        }

        let mut tokens = tokenize(rest)?.into_iter();
        let keyword = tokens.next().ok_or(ParseError::MissingKind)?;
        let kind = MessageKind::from_keyword(&keyword).ok_or(ParseError::UnknownKind(keyword))?;
        let fields: Vec<String> = tokens.collect();

        if !kind.arity().accepts(fields.len()) {
            return Err(ParseError::FieldCount {
                kind,
                expected: kind.arity(),
                actual: fields.len(),
            });
        }

        Ok(Self { kind, fields })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

fn needs_quotes(field: &str) -> bool {
    field.is_empty()
        || field
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\')
}

fn quote(field: &str) -> Cow<'_, str> {
    if !needs_quotes(field) {
        return Cow::Borrowed(field);
    }

    let mut quoted = String::with_capacity(field.len() + 2);
    quoted.push('"');
    for c in field.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');

    Cow::Owned(quoted)
}

// Splits on unquoted whitespace, a token starting with a quote runs to the matching quote.
fn tokenize(input: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = vec![];
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let Some(&first) = chars.peek() else {
            break;
        };

        let mut token = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => token.push(chars.next().ok_or(ParseError::DanglingEscape)?),
                    Some(c) => token.push(c),
                    None => return Err(ParseError::UnterminatedQuote),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                token.push(c);
            }
        }

        tokens.push(token);
    }

    Ok(tokens)
}

// PAYLOADS

/// The status carried by UNREG_OK, JOIN_OK and LEAVE_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    const SUCCESS: &'static str = "0";
    const FAILURE: &'static str = "9999";

    fn code(&self) -> &'static str {
        match self {
            Status::Success => Self::SUCCESS,
            Status::Failure => Self::FAILURE,
        }
    }

    fn from_code(code: &str) -> Result<Self, PayloadError> {
        match code {
            Self::SUCCESS => Ok(Status::Success),
            Self::FAILURE => Ok(Status::Failure),
            _ => Err(PayloadError::invalid("status", code)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl From<bool> for Status {
    fn from(success: bool) -> Self {
        if success {
            Status::Success
        } else {
            Status::Failure
        }
    }
}

/// Error codes returned by the bootstrap server in REG_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    CommandError,
    AlreadyRegistered,
    AddressOccupied,
    ServerFull,
}

impl RegisterError {
    fn code(&self) -> u32 {
        match self {
            RegisterError::CommandError => 9999,
            RegisterError::AlreadyRegistered => 9998,
            RegisterError::AddressOccupied => 9997,
            RegisterError::ServerFull => 9996,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            9999 => Some(RegisterError::CommandError),
            9998 => Some(RegisterError::AlreadyRegistered),
            9997 => Some(RegisterError::AddressOccupied),
            9996 => Some(RegisterError::ServerFull),
            _ => None,
        }
    }
}

/// The outcome carried by JOIN_SUPER_PEER_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSuperPeerStatus {
    /// The requester was added.
    Admitted,
    /// The super-peer is at capacity, the address is an alternate backbone member.
    Full(SocketAddr),
    /// The super-peer is at capacity and knows no other super-peer.
    FullNoAlternative,
    /// The recipient isn't a super-peer.
    Rejected,
}

impl JoinSuperPeerStatus {
    const ADMITTED: &'static str = "0";
    const FULL: &'static str = "9998";
    const FULL_NO_ALTERNATIVE: &'static str = "9997";
    const REJECTED: &'static str = "9999";
}

fn field<'a>(message: &'a Message, index: usize) -> Result<&'a str, PayloadError> {
    message.field(index).ok_or(PayloadError::MissingField {
        kind: message.kind(),
        index,
    })
}

fn expect_kind(message: &Message, expected: MessageKind) -> Result<(), PayloadError> {
    if message.kind() != expected {
        return Err(PayloadError::WrongKind {
            expected,
            actual: message.kind(),
        });
    }

    Ok(())
}

fn parse_number<T: FromStr>(what: &'static str, value: &str) -> Result<T, PayloadError> {
    value.parse().map_err(|_| PayloadError::invalid(what, value))
}

fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr, PayloadError> {
    let ip: IpAddr = ip.parse().map_err(|_| PayloadError::invalid("ip", ip))?;
    let port: u16 = parse_number("port", port)?;

    Ok(SocketAddr::new(ip, port))
}

fn addr_at(message: &Message, index: usize) -> Result<SocketAddr, PayloadError> {
    parse_addr(field(message, index)?, field(message, index + 1)?)
}

fn push_addr(fields: &mut Vec<String>, addr: SocketAddr) {
    fields.push(addr.ip().to_string());
    fields.push(addr.port().to_string());
}

// Reads `count` names starting at `start`, the count must match what is present.
fn names_at(message: &Message, count: usize, start: usize) -> Result<Vec<String>, PayloadError> {
    let names = &message.fields()[start.min(message.fields().len())..];
    if names.len() != count {
        return Err(PayloadError::invalid("name count", &count.to_string()));
    }

    Ok(names.to_vec())
}

// Messages whose only payload is the sender's address.
macro_rules! addr_payload {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $name {
                pub addr: SocketAddr,
            }

            impl From<$name> for Message {
                fn from(payload: $name) -> Self {
                    let mut fields = Vec::with_capacity(2);
                    push_addr(&mut fields, payload.addr);
                    Message::new(MessageKind::$kind, fields)
                }
            }

            impl TryFrom<&Message> for $name {
                type Error = PayloadError;

                fn try_from(message: &Message) -> Result<Self, Self::Error> {
                    expect_kind(message, MessageKind::$kind)?;
                    Ok(Self { addr: addr_at(message, 0)? })
                }
            }
        )*
    };
}

addr_payload! {
    /// The data making up a JOIN message.
    Join => Join,
    /// The data making up a LEAVE message.
    Leave => Leave,
    /// The data making up a HEARTBEAT message.
    Heartbeat => Heartbeat,
    /// The data making up a HEARTBEAT_OK message.
    HeartbeatOk => HeartbeatOk,
    /// The data making up a LIST_RESOURCES message.
    ListResources => ListResources,
}

/// The data making up a REG message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub addr: SocketAddr,
    pub username: String,
}

impl From<Register> for Message {
    fn from(register: Register) -> Self {
        let mut fields = Vec::with_capacity(3);
        push_addr(&mut fields, register.addr);
        fields.push(register.username);
        Message::new(MessageKind::Register, fields)
    }
}

impl TryFrom<&Message> for Register {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::Register)?;
        Ok(Self {
            addr: addr_at(message, 0)?,
            username: field(message, 2)?.to_owned(),
        })
    }
}

/// The data making up an UNREG message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregister {
    pub addr: SocketAddr,
    pub username: String,
}

impl From<Unregister> for Message {
    fn from(unregister: Unregister) -> Self {
        let mut fields = Vec::with_capacity(3);
        push_addr(&mut fields, unregister.addr);
        fields.push(unregister.username);
        Message::new(MessageKind::Unregister, fields)
    }
}

impl TryFrom<&Message> for Unregister {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::Unregister)?;
        Ok(Self {
            addr: addr_at(message, 0)?,
            username: field(message, 2)?.to_owned(),
        })
    }
}

/// The data making up a REG_OK message: either the peers to join or an error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOk {
    Peers(Vec<SocketAddr>),
    Error(RegisterError),
}

impl From<RegisterOk> for Message {
    fn from(register_ok: RegisterOk) -> Self {
        let fields = match register_ok {
            RegisterOk::Peers(peers) => {
                let mut fields = Vec::with_capacity(1 + peers.len() * 2);
                fields.push(peers.len().to_string());
                for peer in peers {
                    push_addr(&mut fields, peer);
                }
                fields
            }
            RegisterOk::Error(error) => vec![error.code().to_string()],
        };

        Message::new(MessageKind::RegisterOk, fields)
    }
}

impl TryFrom<&Message> for RegisterOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, PayloadError> {
        expect_kind(message, MessageKind::RegisterOk)?;
        let count: u32 = parse_number("peer count", field(message, 0)?)?;

        if let Some(error) = RegisterError::from_code(count) {
            return Ok(RegisterOk::Error(error));
        }

        let peers = (0..count as usize)
            .map(|i| addr_at(message, 1 + i * 2))
            .collect::<Result<_, _>>()?;

        Ok(RegisterOk::Peers(peers))
    }
}

/// The data making up an UNREG_OK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterOk {
    pub status: Status,
}

impl From<UnregisterOk> for Message {
    fn from(unregister_ok: UnregisterOk) -> Self {
        Message::new(
            MessageKind::UnregisterOk,
            vec![unregister_ok.status.code().to_owned()],
        )
    }
}

impl TryFrom<&Message> for UnregisterOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::UnregisterOk)?;
        Ok(Self {
            status: Status::from_code(field(message, 0)?)?,
        })
    }
}

/// The data making up a JOIN_OK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOk {
    pub status: Status,
    /// The responder's super-peer (or itself if it is one), so the joiner can skip its search.
    pub super_peer: Option<SocketAddr>,
}

impl From<JoinOk> for Message {
    fn from(join_ok: JoinOk) -> Self {
        let mut fields = vec![join_ok.status.code().to_owned()];
        if let Some(super_peer) = join_ok.super_peer {
            push_addr(&mut fields, super_peer);
        }

        Message::new(MessageKind::JoinOk, fields)
    }
}

impl TryFrom<&Message> for JoinOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::JoinOk)?;
        let super_peer = match message.fields().len() {
            1 => None,
            _ => Some(addr_at(message, 1)?),
        };

        Ok(Self {
            status: Status::from_code(field(message, 0)?)?,
            super_peer,
        })
    }
}

/// The data making up a LEAVE_OK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOk {
    pub status: Status,
}

impl From<LeaveOk> for Message {
    fn from(leave_ok: LeaveOk) -> Self {
        Message::new(MessageKind::LeaveOk, vec![leave_ok.status.code().to_owned()])
    }
}

impl TryFrom<&Message> for LeaveOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::LeaveOk)?;
        Ok(Self {
            status: Status::from_code(field(message, 0)?)?,
        })
    }
}

/// The data making up a SER message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    /// The node that issued the search, replies go straight back to it.
    pub origin: SocketAddr,
    pub query: String,
    pub hops: u32,
}

impl Search {
    pub(crate) const QUERY: usize = 2;
    pub(crate) const HOPS: usize = 3;
}

impl From<Search> for Message {
    fn from(search: Search) -> Self {
        let mut fields = Vec::with_capacity(4);
        push_addr(&mut fields, search.origin);
        fields.push(search.query);
        fields.push(search.hops.to_string());
        Message::new(MessageKind::Search, fields)
    }
}

impl TryFrom<&Message> for Search {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::Search)?;
        Ok(Self {
            origin: addr_at(message, 0)?,
            query: field(message, Self::QUERY)?.to_owned(),
            hops: parse_number("hop count", field(message, Self::HOPS)?)?,
        })
    }
}

/// The data making up a SER_OK message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOk {
    /// The node owning the matches.
    pub addr: SocketAddr,
    pub hops: u32,
    pub names: Vec<String>,
}

impl From<SearchOk> for Message {
    fn from(search_ok: SearchOk) -> Self {
        let mut fields = Vec::with_capacity(4 + search_ok.names.len());
        fields.push(search_ok.names.len().to_string());
        push_addr(&mut fields, search_ok.addr);
        fields.push(search_ok.hops.to_string());
        fields.extend(search_ok.names);
        Message::new(MessageKind::SearchOk, fields)
    }
}

impl TryFrom<&Message> for SearchOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::SearchOk)?;
        let count: usize = parse_number("file count", field(message, 0)?)?;

        Ok(Self {
            addr: addr_at(message, 1)?,
            hops: parse_number("hop count", field(message, 3)?)?,
            names: names_at(message, count, 4)?,
        })
    }
}

/// The data making up a SER_SUPER_PEER message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperPeerSearch {
    pub origin: SocketAddr,
    pub hops: u32,
}

impl SuperPeerSearch {
    pub(crate) const HOPS: usize = 2;
}

impl From<SuperPeerSearch> for Message {
    fn from(search: SuperPeerSearch) -> Self {
        let mut fields = Vec::with_capacity(3);
        push_addr(&mut fields, search.origin);
        fields.push(search.hops.to_string());
        Message::new(MessageKind::SuperPeerSearch, fields)
    }
}

impl TryFrom<&Message> for SuperPeerSearch {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::SuperPeerSearch)?;
        Ok(Self {
            origin: addr_at(message, 0)?,
            hops: parse_number("hop count", field(message, Self::HOPS)?)?,
        })
    }
}

/// The data making up a SER_SUPER_PEER_OK message, `None` travels as [`NOT_FOUND`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperPeerSearchOk {
    pub super_peer: Option<SocketAddr>,
}

impl From<SuperPeerSearchOk> for Message {
    fn from(search_ok: SuperPeerSearchOk) -> Self {
        let mut fields = Vec::with_capacity(2);
        push_addr(&mut fields, search_ok.super_peer.unwrap_or(NOT_FOUND));
        Message::new(MessageKind::SuperPeerSearchOk, fields)
    }
}

impl TryFrom<&Message> for SuperPeerSearchOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::SuperPeerSearchOk)?;
        let addr = addr_at(message, 0)?;

        Ok(Self {
            super_peer: (addr != NOT_FOUND).then_some(addr),
        })
    }
}

/// The data making up a JOIN_SUPER_PEER message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSuperPeer {
    pub addr: SocketAddr,
    /// The requester's role, ordinary peers get assigned, super-peers join the backbone.
    pub role: Role,
}

impl From<JoinSuperPeer> for Message {
    fn from(join: JoinSuperPeer) -> Self {
        let mut fields = Vec::with_capacity(3);
        push_addr(&mut fields, join.addr);
        fields.push(join.role.keyword().to_owned());
        Message::new(MessageKind::JoinSuperPeer, fields)
    }
}

impl TryFrom<&Message> for JoinSuperPeer {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::JoinSuperPeer)?;
        let role = field(message, 2)?;

        Ok(Self {
            addr: addr_at(message, 0)?,
            role: Role::from_keyword(role).ok_or_else(|| PayloadError::invalid("role", role))?,
        })
    }
}

/// The data making up a JOIN_SUPER_PEER_OK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSuperPeerOk {
    pub status: JoinSuperPeerStatus,
}

impl From<JoinSuperPeerOk> for Message {
    fn from(join_ok: JoinSuperPeerOk) -> Self {
        let fields = match join_ok.status {
            JoinSuperPeerStatus::Admitted => vec![JoinSuperPeerStatus::ADMITTED.to_owned()],
            JoinSuperPeerStatus::Full(alternate) => {
                let mut fields = vec![JoinSuperPeerStatus::FULL.to_owned()];
                push_addr(&mut fields, alternate);
                fields
            }
            JoinSuperPeerStatus::FullNoAlternative => {
                vec![JoinSuperPeerStatus::FULL_NO_ALTERNATIVE.to_owned()]
            }
            JoinSuperPeerStatus::Rejected => vec![JoinSuperPeerStatus::REJECTED.to_owned()],
        };

        Message::new(MessageKind::JoinSuperPeerOk, fields)
    }
}

impl TryFrom<&Message> for JoinSuperPeerOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::JoinSuperPeerOk)?;

        let status = match field(message, 0)? {
            JoinSuperPeerStatus::ADMITTED => JoinSuperPeerStatus::Admitted,
            JoinSuperPeerStatus::FULL => JoinSuperPeerStatus::Full(addr_at(message, 1)?),
            JoinSuperPeerStatus::FULL_NO_ALTERNATIVE => JoinSuperPeerStatus::FullNoAlternative,
            JoinSuperPeerStatus::REJECTED => JoinSuperPeerStatus::Rejected,
            code => return Err(PayloadError::invalid("status", code)),
        };

        Ok(Self { status })
    }
}

/// The data making up a LIST_RESOURCES_OK message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResourcesOk {
    pub addr: SocketAddr,
    pub names: Vec<String>,
}

impl From<ListResourcesOk> for Message {
    fn from(list_ok: ListResourcesOk) -> Self {
        let mut fields = Vec::with_capacity(3 + list_ok.names.len());
        push_addr(&mut fields, list_ok.addr);
        fields.push(list_ok.names.len().to_string());
        fields.extend(list_ok.names);
        Message::new(MessageKind::ListResourcesOk, fields)
    }
}

impl TryFrom<&Message> for ListResourcesOk {
    type Error = PayloadError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_kind(message, MessageKind::ListResourcesOk)?;
        let count: usize = parse_number("file count", field(message, 2)?)?;

        Ok(Self {
            addr: addr_at(message, 0)?,
            names: names_at(message, count, 3)?,
        })
    }
}
