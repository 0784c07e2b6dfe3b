#![forbid(unsafe_code)]

//! Game actions and their registry.
//!
//! Action requests arrive as `{ "type": <name>, "data": <payload> }`, either
//! from local input or relayed from a peer, and are dispatched by name to a
//! handler that runs as a tracked root action on the [`Store`].
//!
//! Built-in actions:
//!
//! | Name | Payload | Undoable |
//! |------|---------|----------|
//! | `addEntity` | entity document (`id` optional) | yes |
//! | `removeEntity` | `{id}` | yes |
//! | `moveEntity` | `{id, position}` | yes |
//! | `flipCard` | `{id}` | yes |
//! | `drawCard` | `{id, position?}` (deck id) | yes, includes a nested `moveEntity` |
//! | `shuffleDeck` | `{id, seed}` | yes |
//! | `setSelection` | `{ids}` | no (outside `/entities`) |
//! | `setPlayerName` | `{name}` | no |
//!
//! Dice rolls are two-step flows, see [`begin_roll`] and [`settle_roll`].

use std::collections::BTreeMap;
use std::fmt;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_pcg::Pcg32;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ActionError;
use crate::model::{Entity, EntityId, EntityKind, PlayerId, Position, paths};
use crate::store::{FlowId, Store};
use crate::tracking::{Action, ActionCx};

pub const ADD_ENTITY: &str = "addEntity";
pub const REMOVE_ENTITY: &str = "removeEntity";
pub const MOVE_ENTITY: &str = "moveEntity";
pub const FLIP_CARD: &str = "flipCard";
pub const DRAW_CARD: &str = "drawCard";
pub const SHUFFLE_DECK: &str = "shuffleDeck";
pub const SET_SELECTION: &str = "setSelection";
pub const SET_PLAYER_NAME: &str = "setPlayerName";
pub const ROLL_DICE: &str = "rollDice";

/// A named action with its payload, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl ActionRequest {
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Entity the request targets, when its payload names one.
    #[must_use]
    pub fn target_id(&self) -> Option<EntityId> {
        self.data.get("id").and_then(Value::as_str).map(EntityId::from)
    }
}

/// Handler signature: mutate through the context on behalf of `player`.
pub type Handler = Box<dyn Fn(&mut ActionCx<'_>, &Value, &PlayerId) -> Result<(), ActionError>>;

/// Name → handler table.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in action.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ADD_ENTITY, add_entity);
        registry.register(REMOVE_ENTITY, remove_entity);
        registry.register(MOVE_ENTITY, move_entity);
        registry.register(FLIP_CARD, flip_card);
        registry.register(DRAW_CARD, draw_card);
        registry.register(SHUFFLE_DECK, shuffle_deck);
        registry.register(SET_SELECTION, set_selection);
        registry.register(SET_PLAYER_NAME, set_player_name);
        registry
    }

    /// Add or replace a handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut ActionCx<'_>, &Value, &PlayerId) -> Result<(), ActionError> + 'static,
    ) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Execute `request` as a tracked root action on behalf of `player`.
    pub fn dispatch(
        &self,
        store: &mut Store,
        request: &ActionRequest,
        player: &PlayerId,
    ) -> Result<(), ActionError> {
        let handler = self
            .handlers
            .get(&request.kind)
            .ok_or_else(|| ActionError::UnknownAction(request.kind.clone()))?;
        let target = request
            .target_id()
            .map_or_else(paths::entities, |id| id.path());
        debug!(
            target: "tabletop.tracking",
            action = %request.kind,
            player = %player,
            target_path = %target,
            "dispatch"
        );
        store.run(Action::new(request.kind.clone(), target), |cx| {
            handler(cx, &request.data, player)
        })
    }
}

fn payload<T: DeserializeOwned>(action: &str, data: &Value) -> Result<T, ActionError> {
    T::deserialize(data).map_err(|err| ActionError::payload(action, err))
}

fn entity(cx: &ActionCx<'_>, id: &EntityId) -> Result<Entity, ActionError> {
    if cx.get(&id.path()).is_none() {
        return Err(ActionError::EntityNotFound(id.clone()));
    }
    Ok(cx.get_as(&id.path())?)
}

#[derive(Deserialize)]
struct ById {
    id: EntityId,
}

#[derive(Deserialize)]
struct MovePayload {
    id: EntityId,
    position: Position,
}

#[derive(Deserialize)]
struct DrawPayload {
    id: EntityId,
    #[serde(default)]
    position: Option<Position>,
}

#[derive(Deserialize)]
struct ShufflePayload {
    id: EntityId,
    seed: u64,
}

#[derive(Deserialize)]
struct SelectionPayload {
    ids: Vec<EntityId>,
}

#[derive(Deserialize)]
struct NamePayload {
    name: String,
}

fn add_entity(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let Some(fields) = data.as_object() else {
        return Err(ActionError::payload(ADD_ENTITY, "expected an entity object"));
    };
    let mut next_id = cx
        .get(&paths::next_id())
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let mut fields = fields.clone();
    let allocated = !fields.contains_key("id");
    if allocated {
        // Explicit ids may already occupy `eN`; skip past them.
        while cx.tree().find_node(&format!("e{next_id}")).is_some() {
            next_id += 1;
        }
        fields.insert("id".into(), Value::String(format!("e{next_id}")));
    }
    let entity: Entity = payload(ADD_ENTITY, &Value::Object(fields))?;
    if cx.get(&entity.path()).is_some() || cx.tree().find_node(entity.id.as_str()).is_some() {
        return Err(ActionError::Rejected(format!("entity '{}' already exists", entity.id)));
    }

    if let Some(owner_id) = &entity.owner {
        let owner = self::entity(cx, owner_id)?;
        let Some(field) = owner.kind.children_field() else {
            return Err(ActionError::Rejected(format!("'{owner_id}' cannot hold entities")));
        };
        cx.push(&owner_id.field(field), Value::String(entity.id.to_string()))?;
    }
    if allocated {
        cx.set(&paths::next_id(), Value::from(next_id + 1))?;
    }
    cx.set_as(&entity.path(), &entity)?;
    Ok(())
}

fn detach_from_owner(cx: &mut ActionCx<'_>, child: &Entity) -> Result<(), ActionError> {
    let Some(owner_id) = &child.owner else {
        return Ok(());
    };
    let Ok(owner) = entity(cx, owner_id) else {
        return Ok(());
    };
    if let (Some(field), Some(index)) = (
        owner.kind.children_field(),
        owner.kind.children().iter().position(|id| *id == child.id),
    ) {
        cx.remove(&owner_id.field(field).child(index.to_string()))?;
    }
    cx.set(&child.id.field("owner"), Value::Null)?;
    Ok(())
}

fn remove_entity(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let ById { id } = payload(REMOVE_ENTITY, data)?;
    let target = entity(cx, &id)?;
    detach_from_owner(cx, &target)?;
    for child in target.kind.children() {
        if cx.get(&child.path()).is_some() {
            cx.set(&child.field("owner"), Value::Null)?;
        }
    }
    cx.remove(&id.path())?;
    Ok(())
}

fn move_to(cx: &mut ActionCx<'_>, id: &EntityId, position: Position) -> Result<(), ActionError> {
    let target = entity(cx, id)?;
    if target.locked {
        return Err(ActionError::Rejected(format!("'{id}' is locked")));
    }
    cx.set_as(&id.field("position"), &position)?;
    Ok(())
}

fn move_entity(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let MovePayload { id, position } = payload(MOVE_ENTITY, data)?;
    move_to(cx, &id, position)
}

fn flip_card(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let ById { id } = payload(FLIP_CARD, data)?;
    match entity(cx, &id)?.kind {
        EntityKind::Card { face_up, .. } => {
            cx.set(&id.field("faceUp"), Value::Bool(!face_up))?;
            Ok(())
        }
        other => Err(ActionError::Rejected(format!("'{id}' is a {}, not a card", other.name()))),
    }
}

fn draw_card(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let DrawPayload { id, position } = payload(DRAW_CARD, data)?;
    let deck = entity(cx, &id)?;
    let EntityKind::Deck { cards } = &deck.kind else {
        return Err(ActionError::Rejected(format!("'{id}' is not a deck")));
    };
    let Some(top) = cards.first().cloned() else {
        return Err(ActionError::Rejected(format!("deck '{id}' is empty")));
    };
    cx.remove(&id.field("cards").child("0"))?;
    if cx.get(&top.path()).is_some() {
        cx.set(&top.field("owner"), Value::Null)?;
    }
    let destination = position.unwrap_or_else(|| deck.position.offset(1.5, 0.0));
    cx.call(Action::new(MOVE_ENTITY, top.path()), |cx| {
        move_to(cx, &top, destination)
    })
}

fn shuffle_deck(cx: &mut ActionCx<'_>, data: &Value, _player: &PlayerId) -> Result<(), ActionError> {
    let ShufflePayload { id, seed } = payload(SHUFFLE_DECK, data)?;
    let EntityKind::Deck { mut cards } = entity(cx, &id)?.kind else {
        return Err(ActionError::Rejected(format!("'{id}' is not a deck")));
    };
    let mut rng = Pcg32::seed_from_u64(seed);
    cards.shuffle(&mut rng);
    cx.set_as(&id.field("cards"), &cards)?;
    Ok(())
}

fn set_selection(cx: &mut ActionCx<'_>, data: &Value, player: &PlayerId) -> Result<(), ActionError> {
    let SelectionPayload { ids } = payload(SET_SELECTION, data)?;
    if let Some(missing) = ids.iter().find(|id| cx.get(&id.path()).is_none()) {
        return Err(ActionError::EntityNotFound(missing.clone()));
    }
    cx.set_as(&player.selection_path(), &ids)?;
    Ok(())
}

fn set_player_name(cx: &mut ActionCx<'_>, data: &Value, player: &PlayerId) -> Result<(), ActionError> {
    let NamePayload { name } = payload(SET_PLAYER_NAME, data)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ActionError::payload(SET_PLAYER_NAME, "name must not be empty"));
    }
    if cx.get(&player.path()).is_none() {
        return Err(ActionError::Rejected(format!("unknown player '{player}'")));
    }
    cx.set(&player.path().child("name"), Value::String(name.to_string()))?;
    Ok(())
}

/// A dice roll in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiceRoll {
    pub flow: FlowId,
    pub dice: EntityId,
    pub value: u32,
}

/// First step of a roll: mark the dice as rolling.
///
/// The chosen `value` is applied by [`settle_roll`] once the roll animation
/// has finished; other actions may run in between.
pub fn begin_roll(store: &mut Store, dice: &EntityId, value: u32) -> Result<DiceRoll, ActionError> {
    let flow = store.begin_flow(Action::new(ROLL_DICE, dice.path()));
    let step = store.flow_step(flow, |cx| {
        let EntityKind::Dice { faces, .. } = entity(cx, dice)?.kind else {
            return Err(ActionError::Rejected(format!("'{dice}' is not a dice")));
        };
        if !(1..=faces).contains(&value) {
            return Err(ActionError::payload(
                ROLL_DICE,
                format!("value {value} outside 1..={faces}"),
            ));
        }
        cx.set(&dice.field("rolling"), Value::Bool(true))?;
        Ok(())
    });
    if let Err(err) = step {
        store.end_flow(flow)?;
        return Err(err);
    }
    Ok(DiceRoll {
        flow,
        dice: dice.clone(),
        value,
    })
}

/// Final step of a roll: write the value and stop rolling.
///
/// The flow is finished even if the dice disappeared in the meantime.
pub fn settle_roll(store: &mut Store, roll: &DiceRoll) -> Result<(), ActionError> {
    let step = store.flow_step(roll.flow, |cx| {
        entity(cx, &roll.dice)?;
        cx.set(&roll.dice.field("value"), Value::from(roll.value))?;
        cx.set(&roll.dice.field("rolling"), Value::Bool(false))?;
        Ok(())
    });
    store.end_flow(roll.flow)?;
    step
}

/// Pick a face uniformly.
pub fn roll_value(rng: &mut impl rand::Rng, faces: u32) -> u32 {
    rng.gen_range(1..=faces.max(1))
}
