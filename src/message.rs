use std::time::SystemTime;

use crate::id::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Chat,
    Joined,
    Left,
}

/// One broadcast unit. Cloned into every mailbox, never shared mutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: ConnId,
    pub name: String,
    pub kind: Kind,
    pub body: String,
    pub at: SystemTime,
}

impl Message {
    pub fn chat(sender: ConnId, name: &str, body: String) -> Self {
        Self::new(sender, name, Kind::Chat, body)
    }

    pub fn joined(sender: ConnId, name: &str) -> Self {
        Self::new(sender, name, Kind::Joined, String::new())
    }

    pub fn left(sender: ConnId, name: &str) -> Self {
        Self::new(sender, name, Kind::Left, String::new())
    }

    fn new(sender: ConnId, name: &str, kind: Kind, body: String) -> Self {
        Self {
            sender,
            name: name.to_string(),
            kind,
            body,
            at: SystemTime::now(),
        }
    }

    /// Wire form, without the trailing newline.
    pub fn render(&self) -> String {
        match self.kind {
            Kind::Chat => format!("{}> {}", self.name, self.body),
            Kind::Joined => format!("{} has joined the chat", self.name),
            Kind::Left => format!("{} has left the chat", self.name),
        }
    }
}
