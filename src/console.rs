//! Operator console
//!
//! Line-oriented commands on top of [`MqttHandle`]. The console owns the list
//! of *available* topics resolved from the group catalog; everything else is
//! queried from the handler.

use crate::mqtt::{DisconnectOutcome, MqttHandle, SessionEvent, SubscribeReport};
use crate::topics::{GroupCatalog, Topic};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const HELP: &str = "\
commands:
  connect                      open the broker connection
  disconnect                   unsubscribe everything and close
  state                        connection state
  groups                       list catalog groups
  load <group> <participant>   resolve available topics
  topics                       list available and subscribed topics
  sub <topic|#n|all>...        subscribe (queued while disconnected)
  unsub <topic>                unsubscribe
  pub <topic> <message...>     publish to a subscribed topic
  show [topic]                 latest messages
  series [topic]               numeric series
  stats                        counters
  help                         this text
  quit                         disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("bad topic index {0:?}")]
    BadIndex(String),
}

/// Argument of `sub`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubTarget {
    Topic(Topic),
    /// 1-based position in the available-topics list
    Index(usize),
    All,
}

impl FromStr for SubTarget {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(SubTarget::All);
        }
        match s.strip_prefix('#') {
            // a lone `#` is the MQTT wildcard, not an index
            Some(index) if !index.is_empty() => index
                .parse::<usize>()
                .ok()
                .filter(|i| *i > 0)
                .map(SubTarget::Index)
                .ok_or_else(|| CommandError::BadIndex(s.to_string())),
            _ => Ok(SubTarget::Topic(Topic::from(s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    State,
    Groups,
    Load { group: String, participant: String },
    Topics,
    Sub(Vec<SubTarget>),
    Unsub(Topic),
    Pub { topic: Topic, message: String },
    Show(Option<Topic>),
    Series(Option<Topic>),
    Stats,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match word {
            "" => return Err(CommandError::Empty),
            "connect" => Command::Connect,
            "disconnect" => Command::Disconnect,
            "state" => Command::State,
            "groups" => Command::Groups,
            "load" => match args.as_slice() {
                [group, participant] => Command::Load {
                    group: group.to_string(),
                    participant: participant.to_string(),
                },
                _ => return Err(CommandError::Usage("load <group> <participant>")),
            },
            "topics" => Command::Topics,
            "sub" => {
                if args.is_empty() {
                    return Err(CommandError::Usage("sub <topic|#n|all>..."));
                }
                Command::Sub(
                    args.iter()
                        .map(|a| a.parse())
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            "unsub" => match args.as_slice() {
                [topic] => Command::Unsub(Topic::from(*topic)),
                _ => return Err(CommandError::Usage("unsub <topic>")),
            },
            "pub" => {
                // the message keeps its inner spacing
                let (topic, message) = rest
                    .split_once(char::is_whitespace)
                    .map(|(t, m)| (t, m.trim()))
                    .ok_or(CommandError::Usage("pub <topic> <message...>"))?;
                Command::Pub {
                    topic: Topic::from(topic),
                    message: message.to_string(),
                }
            }
            "show" => Command::Show(args.first().map(|t| Topic::from(*t))),
            "series" => Command::Series(args.first().map(|t| Topic::from(*t))),
            "stats" => Command::Stats,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// One line per session event
pub fn render_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connected { client_id } => format!("* connected as {}", client_id),
        SessionEvent::Message { topic, message } => format!("< {}  {}", topic, message),
        SessionEvent::Error(reason) => format!("! {}", reason),
        SessionEvent::Closed { unexpected: true } => "* connection lost".to_string(),
        SessionEvent::Closed { unexpected: false } => "* disconnected".to_string(),
    }
}

fn render_report(report: &SubscribeReport) -> Vec<String> {
    let mut lines = Vec::new();
    for topic in &report.issued {
        lines.push(format!("subscribed {}", topic));
    }
    for topic in &report.queued {
        lines.push(format!("queued {} until connected", topic));
    }
    for topic in &report.skipped {
        lines.push(format!("{} already requested", topic));
    }
    for (topic, e) in &report.failed {
        lines.push(format!("subscribe to {} failed: {}", topic, e));
    }
    lines
}

pub struct Console {
    handle: MqttHandle,
    catalog: GroupCatalog,
    available: Vec<Topic>,
}

impl Console {
    pub fn new(handle: MqttHandle, catalog: GroupCatalog) -> Self {
        Self {
            handle,
            catalog,
            available: Vec::new(),
        }
    }

    pub fn available(&self) -> &[Topic] {
        &self.available
    }

    /// Runs `command` and returns the lines to print.
    pub async fn execute(&mut self, command: Command) -> Vec<String> {
        debug!("Executing {:?}", command);
        match command {
            Command::Connect => match self.handle.connect().await {
                Ok(ticket) => vec![format!("connecting as {}", ticket.client_id)],
                Err(e) => vec![format!("connect rejected: {}", e)],
            },
            Command::Disconnect | Command::Quit => {
                let outcome = self.handle.disconnect_all().await;
                vec![match outcome {
                    DisconnectOutcome::Clean => "disconnected".to_string(),
                    DisconnectOutcome::AlreadyDisconnected => "not connected".to_string(),
                    DisconnectOutcome::ForcedAfterTimeout => {
                        "disconnected (broker did not acknowledge the close)".to_string()
                    }
                    DisconnectOutcome::Forced => "disconnected (close request failed)".to_string(),
                }]
            }
            Command::State => vec![self.handle.state().await.to_string()],
            Command::Groups => self.catalog.group_names().map(str::to_string).collect(),
            Command::Load { group, participant } => {
                match self.catalog.topics_for(&group, &participant) {
                    Ok(topics) => {
                        info!("Loaded {} topics for {}/{}", topics.len(), group, participant);
                        self.available = topics;
                        self.list_available()
                    }
                    Err(e) => vec![e.to_string()],
                }
            }
            Command::Topics => self.list_topics().await,
            Command::Sub(targets) => match self.select(targets) {
                Ok(topics) => render_report(&self.handle.subscribe(topics).await),
                Err(e) => vec![e.to_string()],
            },
            Command::Unsub(topic) => {
                if self.handle.unsubscribe(topic.clone()).await {
                    vec![format!("unsubscribed {}", topic)]
                } else {
                    vec![format!("cannot unsubscribe {}", topic)]
                }
            }
            Command::Pub { topic, message } => match self.handle.publish(topic, message).await {
                Ok(wire) => vec![format!("> {}", wire)],
                Err(e) => vec![format!("publish rejected: {}", e)],
            },
            Command::Show(topic) => self.show(topic).await,
            Command::Series(topic) => self.series(topic).await,
            Command::Stats => {
                let status = self.handle.status().await;
                vec![
                    format!("state: {}", status.connection_state),
                    format!(
                        "subscribed: {}, queued: {}, available: {}",
                        status.subscribed,
                        status.queued,
                        self.available.len()
                    ),
                    format!(
                        "stored: {}, received: {}, sent: {}",
                        status.stored_messages, status.messages_received, status.messages_sent
                    ),
                ]
            }
            Command::Help => HELP.lines().map(str::to_string).collect(),
        }
    }

    fn select(&self, targets: Vec<SubTarget>) -> Result<Vec<Topic>, CommandError> {
        let mut topics = Vec::new();
        for target in targets {
            match target {
                SubTarget::All => topics.extend(self.available.iter().cloned()),
                SubTarget::Index(i) => {
                    let topic = i
                        .checked_sub(1)
                        .and_then(|pos| self.available.get(pos))
                        .ok_or_else(|| CommandError::BadIndex(format!("#{}", i)))?;
                    topics.push(topic.clone());
                }
                SubTarget::Topic(topic) => topics.push(topic),
            }
        }
        Ok(topics)
    }

    fn list_available(&self) -> Vec<String> {
        self.available
            .iter()
            .enumerate()
            .map(|(i, topic)| format!("#{:<3} {:<10} {}", i + 1, topic.display_name(), topic))
            .collect()
    }

    async fn list_topics(&self) -> Vec<String> {
        let snapshot = self.handle.subscriptions().await;
        let mut lines = vec!["available:".to_string()];
        lines.extend(self.list_available());
        lines.push("subscribed:".to_string());
        lines.extend(snapshot.subscribed.iter().map(|t| format!("  {}", t)));
        if !snapshot.queued.is_empty() {
            lines.push("queued:".to_string());
            lines.extend(snapshot.queued.iter().map(|t| format!("  {}", t)));
        }
        lines
    }

    async fn show(&self, topic: Option<Topic>) -> Vec<String> {
        let window = self.handle.display().latest_window;
        let topics = match topic {
            Some(topic) => vec![topic],
            None => self.handle.subscriptions().await.subscribed,
        };

        let mut lines = Vec::new();
        for topic in topics {
            lines.push(format!("[{}]", topic));
            let messages = self.handle.latest_messages(topic, window).await;
            if messages.is_empty() {
                lines.push("  (no messages)".to_string());
            }
            lines.extend(messages.iter().map(|m| format!("  {}", m)));
        }
        lines
    }

    async fn series(&self, topic: Option<Topic>) -> Vec<String> {
        let topic = match topic {
            Some(topic) => topic,
            None => match self.handle.series_topic().await {
                Some(topic) => topic,
                None => {
                    warn!("No series topic has messages yet");
                    return vec!["no series data".to_string()];
                }
            },
        };

        let window = self.handle.display().series_window;
        let points = self.handle.numeric_series(topic.clone(), window).await;
        let mut lines = vec![format!("[{}] {} points", topic, points.len())];
        lines.extend(
            points
                .iter()
                .map(|p| format!("  {:>5}  {:>12.4}", p.index, p.value)),
        );
        lines
    }
}
