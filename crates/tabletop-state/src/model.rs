#![forbid(unsafe_code)]

//! Typed view of the game-state document.
//!
//! The tree stores plain JSON; these types describe its shape and are used
//! to read and write whole nodes. Entities are a tagged union over their
//! kinds rather than a class hierarchy, and every relation between entities
//! (a card's owning deck, a set's members) is an id, never a reference.
//!
//! ```text
//! {
//!   "id": "game",
//!   "nextId": 4,
//!   "players":   { "<playerId>": { "id", "name" } },
//!   "entities":  { "<entityId>": { "id", "kind", "position", ... } },
//!   "selection": { "<playerId>": ["<entityId>", ...] }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::Path;
use crate::tree::StateTree;

/// Id of the root node.
pub const ROOT_ID: &str = "game";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable identifier of an entity node.
    EntityId
);
string_id!(
    /// Identifier of a participant; equal to its transport peer id.
    PlayerId
);

/// Top-level collections of the document.
pub mod paths {
    use super::*;

    #[must_use]
    pub fn entities() -> Path {
        Path::from_segments(["entities"])
    }

    #[must_use]
    pub fn players() -> Path {
        Path::from_segments(["players"])
    }

    #[must_use]
    pub fn selection() -> Path {
        Path::from_segments(["selection"])
    }

    #[must_use]
    pub fn next_id() -> Path {
        Path::from_segments(["nextId"])
    }
}

impl EntityId {
    /// Path of this entity's node.
    #[must_use]
    pub fn path(&self) -> Path {
        paths::entities().child(self.0.as_str())
    }

    /// Path of one field of this entity.
    #[must_use]
    pub fn field(&self, name: &str) -> Path {
        self.path().child(name)
    }
}

impl PlayerId {
    #[must_use]
    pub fn path(&self) -> Path {
        paths::players().child(self.0.as_str())
    }

    #[must_use]
    pub fn selection_path(&self) -> Path {
        paths::selection().child(self.0.as_str())
    }
}

/// A point on (or above) the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z,
        }
    }
}

/// A connected participant.
///
/// The record holds only what replicates. The host maps live connections to
/// players in its replication channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
}

impl Player {
    #[must_use]
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Kind-specific data of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntityKind {
    #[serde(rename_all = "camelCase")]
    Card {
        front: String,
        back: String,
        #[serde(default)]
        face_up: bool,
    },
    /// Cards are listed top first.
    Deck {
        #[serde(default)]
        cards: Vec<EntityId>,
    },
    Dice {
        faces: u32,
        value: u32,
        #[serde(default)]
        rolling: bool,
    },
    Piece {
        color: String,
        #[serde(default)]
        label: String,
    },
    EntitySet {
        #[serde(default)]
        members: Vec<EntityId>,
    },
}

impl EntityKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Card { .. } => "card",
            Self::Deck { .. } => "deck",
            Self::Dice { .. } => "dice",
            Self::Piece { .. } => "piece",
            Self::EntitySet { .. } => "entitySet",
        }
    }

    /// Children referenced by id, for container kinds.
    #[must_use]
    pub fn children(&self) -> &[EntityId] {
        match self {
            Self::Deck { cards } => cards,
            Self::EntitySet { members } => members,
            _ => &[],
        }
    }

    /// Field name holding the children list, for container kinds.
    #[must_use]
    pub fn children_field(&self) -> Option<&'static str> {
        match self {
            Self::Deck { .. } => Some("cards"),
            Self::EntitySet { .. } => Some("members"),
            _ => None,
        }
    }
}

/// A game object on the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub locked: bool,
    /// Container (deck or set) holding this entity.
    #[serde(default)]
    pub owner: Option<EntityId>,
    #[serde(flatten)]
    pub kind: EntityKind,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind) -> Self {
        Self {
            id,
            position: Position::default(),
            rotation: 0.0,
            locked: false,
            owner: None,
            kind,
        }
    }

    #[must_use]
    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn path(&self) -> Path {
        self.id.path()
    }

    /// Document form of this entity.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Anything that occupies a spot on the table.
pub trait Placeable {
    fn position(&self) -> Position;
    fn set_position(&mut self, position: Position);
}

impl Placeable for Entity {
    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

/// The whole game document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub id: String,
    pub next_id: u64,
    #[serde(default)]
    pub players: BTreeMap<PlayerId, Player>,
    #[serde(default)]
    pub entities: BTreeMap<EntityId, Entity>,
    #[serde(default)]
    pub selection: BTreeMap<PlayerId, Vec<EntityId>>,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            next_id: 1,
            players: BTreeMap::new(),
            entities: BTreeMap::new(),
            selection: BTreeMap::new(),
        }
    }
}

impl GameState {
    /// Add an entity, returning `self` for chaining in setups and tests.
    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.insert(entity.id.clone(), entity);
        self
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Build a tree holding this document.
    pub fn into_tree(self) -> Result<StateTree, serde_json::Error> {
        Ok(StateTree::new(self.to_value()?))
    }

    /// Read the typed document back out of a tree.
    pub fn from_tree(tree: &StateTree) -> Result<Self, serde_json::Error> {
        Self::deserialize(tree.root())
    }
}
