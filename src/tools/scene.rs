//! In-memory scene backend

use super::{AddObjectInput, BackendError, SceneCommand, ToolBackend};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SceneObject {
    id: String,
    kind: String,
    label: Option<String>,
    position: [f64; 3],
}

/// Rooms keyed by lowercase name so lookups ignore case
#[derive(Debug, Default)]
struct Scene {
    rooms: BTreeMap<String, Room>,
}

#[derive(Debug)]
struct Room {
    name: String,
    objects: Vec<SceneObject>,
}

/// Scene state held in process memory
#[derive(Debug, Default)]
pub struct SceneBackend {
    scene: Mutex<Scene>,
}

impl SceneBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.lock().rooms.values().map(|r| r.name.clone()).collect()
    }

    pub fn object_count(&self, room: &str) -> Option<usize> {
        self.lock()
            .rooms
            .get(&room.to_lowercase())
            .map(|r| r.objects.len())
    }

    /// One-line-per-room summary for the system prompt
    pub fn summary(&self) -> String {
        let scene = self.lock();
        if scene.rooms.is_empty() {
            return "The scene is empty.".to_string();
        }
        let mut out = String::new();
        for room in scene.rooms.values() {
            let kinds: Vec<&str> = room.objects.iter().map(|o| o.kind.as_str()).collect();
            if kinds.is_empty() {
                let _ = writeln!(out, "- {} (empty)", room.name);
            } else {
                let _ = writeln!(out, "- {}: {}", room.name, kinds.join(", "));
            }
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Scene> {
        self.scene.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_room(&self, name: &str) -> Result<String, BackendError> {
        let mut scene = self.lock();
        let key = name.to_lowercase();
        if scene.rooms.contains_key(&key) {
            return Err(BackendError::new(format!("A room named \"{name}\" already exists.")));
        }
        scene.rooms.insert(
            key,
            Room {
                name: name.to_string(),
                objects: Vec::new(),
            },
        );
        tracing::info!(room = %name, "Room created");
        Ok(format!("Successfully created room \"{name}\"."))
    }

    fn add_object(&self, input: &AddObjectInput) -> Result<String, BackendError> {
        let mut scene = self.lock();
        let room = scene
            .rooms
            .get_mut(&input.room.to_lowercase())
            .ok_or_else(|| no_such_room(&input.room))?;

        let object = SceneObject {
            id: Uuid::new_v4().to_string(),
            kind: input.kind.clone(),
            label: input.label.clone(),
            position: input.position.unwrap_or([0.0, 0.0, 0.0]),
        };
        let id = object.id.clone();
        room.objects.push(object);
        tracing::info!(room = %room.name, kind = %input.kind, id = %id, "Object added");
        Ok(format!(
            "Added {} to \"{}\" with id {id}.",
            input.kind, room.name
        ))
    }

    fn remove_object(&self, room_name: &str, object_id: &str) -> Result<String, BackendError> {
        let mut scene = self.lock();
        let room = scene
            .rooms
            .get_mut(&room_name.to_lowercase())
            .ok_or_else(|| no_such_room(room_name))?;

        let position = room
            .objects
            .iter()
            .position(|o| o.id == object_id)
            .ok_or_else(|| {
                BackendError::new(format!(
                    "No object with id {object_id} in \"{}\".",
                    room.name
                ))
            })?;
        let removed = room.objects.remove(position);
        Ok(format!("Removed {} from \"{}\".", removed.kind, room.name))
    }

    fn list_rooms(&self) -> String {
        let scene = self.lock();
        if scene.rooms.is_empty() {
            return "There are no rooms yet.".to_string();
        }
        let mut out = String::new();
        for room in scene.rooms.values() {
            let _ = writeln!(out, "{} ({} objects)", room.name, room.objects.len());
            for o in &room.objects {
                let [x, y, z] = o.position;
                let label = o.label.as_deref().unwrap_or(&o.kind);
                let _ = writeln!(out, "  - {label} [{}] id={} at ({x}, {y}, {z})", o.kind, o.id);
            }
        }
        out
    }
}

fn no_such_room(name: &str) -> BackendError {
    BackendError::new(format!(
        "There is no room named \"{name}\". Create it with create_room first."
    ))
}

#[async_trait]
impl ToolBackend for SceneBackend {
    fn is_ready(&self) -> bool {
        true
    }

    async fn execute(&self, command: &SceneCommand) -> Result<String, BackendError> {
        match command {
            SceneCommand::CreateRoom(input) => self.create_room(&input.name),
            SceneCommand::AddObject(input) => self.add_object(input),
            SceneCommand::RemoveObject(input) => self.remove_object(&input.room, &input.object_id),
            SceneCommand::ListRooms => Ok(self.list_rooms()),
        }
    }
}
