//! Room-level tools: `create_room` and `list_rooms`

use super::{parse_input, require_non_empty, SceneCommand, Tool};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateRoomInput {
    pub name: String,
}

pub struct CreateRoomTool;

impl CreateRoomTool {
    pub const NAME: &'static str = "create_room";
}

impl Tool for CreateRoomTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> String {
        "Create a new, empty room in the scene. Room names are unique; create a room before adding objects to it.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Display name of the room, e.g. \"Library\""
                }
            }
        })
    }

    fn parse(&self, input: &Value) -> Result<SceneCommand, String> {
        let parsed: CreateRoomInput = parse_input(input)?;
        Ok(SceneCommand::CreateRoom(CreateRoomInput {
            name: require_non_empty("name", &parsed.name)?,
        }))
    }

    fn fallback(&self, command: &SceneCommand) -> String {
        match command {
            SceneCommand::CreateRoom(input) => format!(
                "Room \"{}\" was noted, but the scene editor is not connected yet. It will be created once the editor is available.",
                input.name
            ),
            _ => "The scene editor is not connected yet.".to_string(),
        }
    }
}

pub struct ListRoomsTool;

impl ListRoomsTool {
    pub const NAME: &'static str = "list_rooms";
}

impl Tool for ListRoomsTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> String {
        "List every room in the scene with its objects and their ids.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    fn parse(&self, input: &Value) -> Result<SceneCommand, String> {
        // No arguments, but a non-object is still a malformed call
        if input.is_object() {
            Ok(SceneCommand::ListRooms)
        } else {
            Err(format!("expected a JSON object, got {input}"))
        }
    }

    fn fallback(&self, _command: &SceneCommand) -> String {
        "The scene editor is not connected yet, so no rooms can be listed.".to_string()
    }
}
