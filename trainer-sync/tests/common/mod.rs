#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use stash::{KeyValueStore, LocalCache, MemoryStore};
use trainer_sync::backend::Table;
use trainer_sync::{InMemoryBackend, RecordingNotifier, SyncConfig, SyncContext, build_cache};

pub const TRAINER: &str = "trainer-1";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `2024-01-01T00:00:00Z` plus `seconds`.
pub fn stamp(seconds: i64) -> String {
    format!("2024-01-01T{:02}:{:02}:00Z", seconds / 60, seconds % 60)
}

pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub store: Arc<MemoryStore>,
    pub cache: LocalCache,
    pub notifier: Arc<RecordingNotifier>,
    pub config: SyncConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        init_logging();
        let store = Arc::new(MemoryStore::new());
        let cache = build_cache(Arc::clone(&store) as Arc<dyn KeyValueStore>, &config);
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            store,
            cache,
            notifier: Arc::new(RecordingNotifier::new()),
            config,
        }
    }

    pub fn context(&self) -> SyncContext {
        SyncContext::new(TRAINER, self.cache.clone())
            .with_config(self.config.clone())
            .with_notifier(self.notifier.clone())
    }

    pub fn profile(&self, student: &str, name: &str) {
        self.backend.seed(
            Table::Profiles,
            json!({"id": student, "full_name": name, "email": format!("{student}@example.com")}),
        );
    }

    pub fn member(&self, id: i64, student: &str, name: &str) -> Value {
        self.profile(student, name);
        self.backend.seed(
            Table::TrainerStudents,
            json!({
                "id": id,
                "trainer_id": TRAINER,
                "student_id": student,
                "status": "active",
                "created_at": stamp(id),
            }),
        )
    }

    pub fn request_row(&self, id: i64, student: &str, requested_by: &str) -> Value {
        json!({
            "id": id,
            "trainer_id": TRAINER,
            "student_id": student,
            "requested_by": requested_by,
            "status": "pending",
            "created_at": stamp(100 + id),
        })
    }

    pub fn request(&self, id: i64, student: &str, requested_by: &str, name: &str) -> Value {
        self.profile(student, name);
        self.backend
            .seed(Table::TrainerRequests, self.request_row(id, student, requested_by))
    }

    pub fn guest(&self, id: i64, name: &str) -> Value {
        self.backend.seed(
            Table::TrainerGuests,
            json!({
                "id": id,
                "trainer_id": TRAINER,
                "full_name": name,
                "status": "active",
                "created_at": stamp(200 + id),
            }),
        )
    }

    pub fn routine(&self, id: i64, name: &str) -> Value {
        self.backend.seed(
            Table::Routines,
            json!({
                "id": id,
                "trainer_id": TRAINER,
                "name": name,
                "created_at": stamp(id),
            }),
        )
    }

    pub fn block(&self, id: i64, routine_id: i64, name: &str, order: u32) -> Value {
        self.backend.seed(
            Table::RoutineBlocks,
            json!({"id": id, "routine_id": routine_id, "name": name, "order": order}),
        )
    }

    pub fn exercise(&self, id: i64, block_id: i64, name: &str, order: u32) -> Value {
        self.backend.seed(
            Table::BlockExercises,
            json!({
                "id": id,
                "block_id": block_id,
                "name": name,
                "sets": 3,
                "reps": "8-10",
                "order": order,
            }),
        )
    }
}
