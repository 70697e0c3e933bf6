//! Object tools: `add_object` and `remove_object`

use super::{parse_input, require_non_empty, SceneCommand, Tool};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddObjectInput {
    pub room: String,
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    /// `[x, y, z]` in room-local metres
    #[serde(default)]
    pub position: Option<[f64; 3]>,
}

pub struct AddObjectTool;

impl AddObjectTool {
    pub const NAME: &'static str = "add_object";
}

impl Tool for AddObjectTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Place an object (furniture, lamp, plant, ...) in an existing room. Returns the new object's id.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["room", "kind"],
            "properties": {
                "room": {
                    "type": "string",
                    "description": "Name of the room to place the object in"
                },
                "kind": {
                    "type": "string",
                    "description": "What the object is, e.g. \"bookshelf\""
                },
                "label": {
                    "type": "string",
                    "description": "Optional display label"
                },
                "position": {
                    "type": "array",
                    "items": { "type": "number" },
                    "minItems": 3,
                    "maxItems": 3,
                    "description": "Optional [x, y, z] position in metres"
                }
            }
        })
    }

    fn parse(&self, input: &Value) -> Result<SceneCommand, String> {
        let parsed: AddObjectInput = parse_input(input)?;
        if let Some(position) = parsed.position {
            if position.iter().any(|c| !c.is_finite()) {
                return Err("`position` must contain finite numbers".to_string());
            }
        }
        Ok(SceneCommand::AddObject(AddObjectInput {
            room: require_non_empty("room", &parsed.room)?,
            kind: require_non_empty("kind", &parsed.kind)?,
            label: parsed
                .label
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            position: parsed.position,
        }))
    }

    fn fallback(&self, command: &SceneCommand) -> String {
        match command {
            SceneCommand::AddObject(input) => format!(
                "A {} was noted for room \"{}\", but the scene editor is not connected yet.",
                input.kind, input.room
            ),
            _ => "The scene editor is not connected yet.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoveObjectInput {
    pub room: String,
    pub object_id: String,
}

pub struct RemoveObjectTool;

impl RemoveObjectTool {
    pub const NAME: &'static str = "remove_object";
}

impl Tool for RemoveObjectTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Remove an object from a room by id. Use list_rooms to look up ids.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["room", "object_id"],
            "properties": {
                "room": { "type": "string" },
                "object_id": { "type": "string" }
            }
        })
    }

    fn parse(&self, input: &Value) -> Result<SceneCommand, String> {
        let parsed: RemoveObjectInput = parse_input(input)?;
        Ok(SceneCommand::RemoveObject(RemoveObjectInput {
            room: require_non_empty("room", &parsed.room)?,
            object_id: require_non_empty("object_id", &parsed.object_id)?,
        }))
    }

    fn fallback(&self, _command: &SceneCommand) -> String {
        "The scene editor is not connected yet, so nothing was removed.".to_string()
    }
}
