use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(InstanceId);
id_newtype!(StatementId);
id_newtype!(CommentId);

impl StatementId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl CommentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The four sequences an item can live in. An item belongs to exactly one
/// list at a time; lookups scan goods, bads, actions, trash in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListName {
    Goods,
    Bads,
    Actions,
    Trash,
}

impl ListName {
    pub const ALL: [ListName; 4] = [
        ListName::Goods,
        ListName::Bads,
        ListName::Actions,
        ListName::Trash,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// An emoji annotation and the participants who applied it. An entry with an
/// empty `names` set must not exist; the toggle removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub text: String,
    pub author: String,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub ups: Vec<String>,
    #[serde(default)]
    pub downs: Vec<String>,
    #[serde(default)]
    pub emoji: Vec<Reaction>,
}

impl Comment {
    pub fn new(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: CommentId::generate(),
            text: text.into(),
            author: author.into(),
            is_edited: false,
            ups: Vec::new(),
            downs: Vec::new(),
            emoji: Vec::new(),
        }
    }

    pub fn side(&self, direction: Direction) -> &Vec<String> {
        match direction {
            Direction::Up => &self.ups,
            Direction::Down => &self.downs,
        }
    }

    pub fn side_mut(&mut self, direction: Direction) -> &mut Vec<String> {
        match direction {
            Direction::Up => &mut self.ups,
            Direction::Down => &mut self.downs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: StatementId,
    pub text: String,
    pub author: String,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub ups: Vec<String>,
    #[serde(default)]
    pub downs: Vec<String>,
    #[serde(default)]
    pub emoji: Vec<Reaction>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Originating list, recorded when the item is moved into trash so a
    /// restore knows where it came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ListName>,
}

impl Statement {
    pub fn new(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: StatementId::generate(),
            text: text.into(),
            author: author.into(),
            is_edited: false,
            ups: Vec::new(),
            downs: Vec::new(),
            emoji: Vec::new(),
            comments: Vec::new(),
            from: None,
        }
    }

    pub fn side(&self, direction: Direction) -> &Vec<String> {
        match direction {
            Direction::Up => &self.ups,
            Direction::Down => &self.downs,
        }
    }

    pub fn side_mut(&mut self, direction: Direction) -> &mut Vec<String> {
        match direction {
            Direction::Up => &mut self.ups,
            Direction::Down => &mut self.downs,
        }
    }

    /// Every vote recorded on this statement and its comments, one entry per
    /// spent vote. Used to credit the ledger before the statement is dropped.
    pub fn recorded_votes(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        names.extend(self.ups.iter().cloned());
        names.extend(self.downs.iter().cloned());
        for comment in &self.comments {
            names.extend(comment.ups.iter().cloned());
            names.extend(comment.downs.iter().cloned());
        }
        names
    }
}

/// One collaborative board and all its state. The live copy in the registry
/// is the single source of truth while populated; the persisted document is
/// a full-replace mirror written after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub owner: String,
    pub votes_allowed: u32,
    #[serde(default)]
    pub negative_votes_allowed: bool,
    #[serde(default)]
    pub emoji_allowed: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub trash_is_locked: bool,
    #[serde(default)]
    pub goods: Vec<Statement>,
    #[serde(default)]
    pub bads: Vec<Statement>,
    #[serde(default)]
    pub actions: Vec<Statement>,
    #[serde(default)]
    pub trash: Vec<Statement>,
    /// Currently-present participant names. Session-scoped: a persisted
    /// `users` list reflects a previous session and is reset on load.
    #[serde(default)]
    pub users: Vec<String>,
    /// Remaining vote budget per participant name.
    #[serde(default)]
    pub votes: HashMap<String, u32>,
}

impl Instance {
    pub fn new(
        id: InstanceId,
        owner: impl Into<String>,
        votes_allowed: u32,
        negative_votes_allowed: bool,
        emoji_allowed: bool,
    ) -> Self {
        let owner = owner.into();
        let mut votes = HashMap::new();
        votes.insert(owner.clone(), votes_allowed);
        Self {
            id,
            owner: owner.clone(),
            votes_allowed,
            negative_votes_allowed,
            emoji_allowed,
            locked: false,
            trash_is_locked: false,
            goods: Vec::new(),
            bads: Vec::new(),
            actions: Vec::new(),
            trash: Vec::new(),
            users: vec![owner],
            votes,
        }
    }

    pub fn list(&self, name: ListName) -> &Vec<Statement> {
        match name {
            ListName::Goods => &self.goods,
            ListName::Bads => &self.bads,
            ListName::Actions => &self.actions,
            ListName::Trash => &self.trash,
        }
    }

    pub fn list_mut(&mut self, name: ListName) -> &mut Vec<Statement> {
        match name {
            ListName::Goods => &mut self.goods,
            ListName::Bads => &mut self.bads,
            ListName::Actions => &mut self.actions,
            ListName::Trash => &mut self.trash,
        }
    }

    /// Position of a statement, scanning all four lists in order. Where the
    /// same id somehow appears more than once, the last match wins.
    pub fn locate_statement(&self, id: &StatementId) -> Option<(ListName, usize)> {
        let mut found = None;
        for list in ListName::ALL {
            for (index, statement) in self.list(list).iter().enumerate() {
                if statement.id == *id {
                    found = Some((list, index));
                }
            }
        }
        found
    }

    pub fn statement_mut(&mut self, id: &StatementId) -> Option<&mut Statement> {
        let (list, index) = self.locate_statement(id)?;
        self.list_mut(list).get_mut(index)
    }

    pub fn remaining_votes(&self, name: &str) -> u32 {
        self.votes.get(name).copied().unwrap_or(0)
    }

    /// Return one spent vote to a participant's ledger balance.
    pub fn credit_vote(&mut self, name: &str) {
        *self.votes.entry(name.to_string()).or_insert(0) += 1;
    }
}
