use std::sync::{Arc, Weak};

use chrono::Utc;
use im::Vector;
use stash::{Family, Mutation};
use trainer_types::rows::{AssignmentRow, BlockRow, BlockExerciseRow, NewAssignment, RoutineRow};
use trainer_types::{Block, BlockExercise, Routine, RoutineId, TemporaryIds, build_routines};

use crate::backend::{Backend, BackendError, Filter, Subscription, Table};
use crate::channel::{ChannelManager, ChannelState, ChannelTarget};
use crate::engine::{Engine, Source};
use crate::error::SaveStage;
use crate::notify::Notification;
use crate::queries::{self, decode_row, encode_row};
use crate::state::{ListenerKey, Snapshot};
use crate::{SyncContext, SyncError};

pub const ROUTINES: Family = Family::new("routines");

static TEMPORARY_IDS: TemporaryIds = TemporaryIds::new();

fn at(stage: SaveStage) -> impl FnOnce(BackendError) -> SyncError {
    move |source| SyncError::PartialWrite { stage, source }
}

/// The trainer's routine library, with blocks and exercises nested in order.
pub struct RoutineSource<B> {
    backend: Arc<B>,
}

impl<B: Backend> Source for RoutineSource<B> {
    type Item = Routine;

    const FAMILY: Family = ROUTINES;
    const NOUN: &'static str = "routines";

    async fn fetch(&self, owner_id: &str) -> Result<Vec<Routine>, BackendError> {
        let backend = self.backend.as_ref();
        let routines = queries::query_routines(backend, owner_id).await?;
        let routine_ids: Vec<i64> = routines.iter().map(|routine| routine.id).collect();
        let blocks = queries::query_blocks(backend, &routine_ids).await?;
        let block_ids: Vec<i64> = blocks.iter().map(|block| block.id).collect();
        let exercises = queries::query_block_exercises(backend, &block_ids).await?;

        Ok(build_routines(&routines, &blocks, &exercises))
    }

    async fn remote_count(&self, owner_id: &str) -> Result<usize, BackendError> {
        queries::count_routines(self.backend.as_ref(), owner_id).await
    }

    /// Drafts that were never saved have no row to count.
    fn comparable_count(&self, items: &Vector<Routine>) -> usize {
        items
            .iter()
            .filter(|routine| !routine.id.is_temporary())
            .count()
    }

    /// Unsaved drafts stay on top of the fetched library.
    fn merge_local(&self, visible: &Vector<Routine>, fetched: Vec<Routine>) -> Vec<Routine> {
        visible
            .iter()
            .filter(|routine| routine.id.is_temporary())
            .cloned()
            .chain(fetched)
            .collect()
    }
}

pub struct RoutineSync<B: Backend> {
    backend: Arc<B>,
    engine: Arc<Engine<RoutineSource<B>>>,
    channels: ChannelManager<B>,
}

impl<B: Backend> RoutineSync<B> {
    pub fn new(backend: Arc<B>, context: &SyncContext) -> Self {
        let source = RoutineSource {
            backend: Arc::clone(&backend),
        };
        Self {
            engine: Engine::new(source, context),
            channels: ChannelManager::new(Arc::clone(&backend), context.config.clone()),
            backend,
        }
    }

    pub fn engine(&self) -> &Arc<Engine<RoutineSource<B>>> {
        &self.engine
    }

    pub async fn load(&self, force_refresh: bool) -> Result<Vector<Routine>, SyncError> {
        self.engine.load(force_refresh).await
    }

    pub async fn refresh(&self) -> Result<Vector<Routine>, SyncError> {
        self.engine.refresh().await
    }

    pub fn refresh_debounced(&self) {
        self.engine.refresh_debounced()
    }

    pub fn snapshot(&self) -> Snapshot<Routine> {
        self.engine.snapshot()
    }

    pub fn routines(&self) -> Vector<Routine> {
        self.engine.items()
    }

    pub fn register_listener(
        &self,
        listener: impl Fn(&Snapshot<Routine>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.engine.register_listener(listener)
    }

    pub fn unregister_listener(&self, key: ListenerKey) -> bool {
        self.engine.unregister_listener(key)
    }

    pub fn routines_channel(&self) -> String {
        format!("routines:{}", self.engine.owner_id())
    }

    pub fn connect(&self) {
        let target: Weak<dyn ChannelTarget> =
            Arc::downgrade(&self.engine) as Weak<dyn ChannelTarget>;
        self.channels.open(
            Subscription {
                channel: self.routines_channel(),
                table: Table::Routines,
                filter: Filter::new().eq("trainer_id", self.engine.owner_id()),
            },
            target,
        );
    }

    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.channels.state(channel)
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.channels.close_all().await;
    }

    /// Start a routine locally. It gets a real id the first time it is saved.
    pub fn create_draft(&self, name: &str) -> Result<Routine, SyncError> {
        self.engine.ensure_alive()?;
        let draft = Routine::draft(TEMPORARY_IDS.next(Utc::now()), name, Utc::now());
        self.engine.apply(Mutation::Prepend(draft.clone()))?;
        Ok(draft)
    }

    /// Persist a routine. Drafts are inserted level by level; saved routines are updated.
    pub async fn save(&self, routine: Routine) -> Result<Routine, SyncError> {
        if !routine.id.is_temporary() {
            return self.update(routine).await;
        }
        let result = self.create(routine).await;
        self.engine.report(
            &result,
            |routine| {
                Notification::success(
                    "Routine saved",
                    format!("{} was saved", routine.name),
                )
            },
            "Couldn't save the routine",
        );
        result
    }

    async fn create(&self, draft: Routine) -> Result<Routine, SyncError> {
        self.engine.ensure_alive()?;
        let row = self
            .backend
            .insert(
                Table::Routines,
                encode_row(&draft.insert_row(self.engine.owner_id()))?,
            )
            .await
            .map_err(at(SaveStage::Routine))?;
        let row: RoutineRow = decode_row(Table::Routines, row).map_err(at(SaveStage::Routine))?;
        let blocks = self.insert_blocks(row.id, &draft.blocks).await?;

        let saved = Routine {
            id: RoutineId::Persisted(row.id),
            name: row.name,
            description: row.description,
            blocks,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        log::info!("Routine {} saved as {}", draft.id, saved.id);
        self.engine.apply(Mutation::Replace {
            key: draft.id,
            item: saved.clone(),
        })?;
        Ok(saved)
    }

    /// Insert every block and exercise in array order. Stops at the first failure.
    async fn insert_blocks(
        &self,
        routine_id: i64,
        blocks: &[Block],
    ) -> Result<Vec<Block>, SyncError> {
        let mut saved = Vec::with_capacity(blocks.len());
        for (position, block) in blocks.iter().enumerate() {
            let order = position as u32;
            let stage = SaveStage::Block { block: position };
            let row = self
                .backend
                .insert(
                    Table::RoutineBlocks,
                    encode_row(&block.insert_row(routine_id, order))?,
                )
                .await
                .map_err(at(stage))?;
            let row: BlockRow = decode_row(Table::RoutineBlocks, row).map_err(at(stage))?;

            let mut exercises = Vec::with_capacity(block.exercises.len());
            for (index, exercise) in block.exercises.iter().enumerate() {
                let stage = SaveStage::Exercise {
                    block: position,
                    exercise: index,
                };
                let exercise_row = self
                    .backend
                    .insert(
                        Table::BlockExercises,
                        encode_row(&exercise.insert_row(row.id, index as u32))?,
                    )
                    .await
                    .map_err(at(stage))?;
                let exercise_row: BlockExerciseRow =
                    decode_row(Table::BlockExercises, exercise_row).map_err(at(stage))?;
                exercises.push(BlockExercise {
                    id: Some(exercise_row.id),
                    order: exercise_row.order,
                    ..exercise.clone()
                });
            }

            saved.push(Block {
                id: Some(row.id),
                name: row.name,
                order: row.order,
                exercises,
            });
        }
        Ok(saved)
    }

    /// Rewrite a saved routine: the row is patched, its blocks and exercises are replaced.
    pub async fn update(&self, routine: Routine) -> Result<Routine, SyncError> {
        let result = self.update_inner(routine).await;
        self.engine.report(
            &result,
            |routine| {
                Notification::success(
                    "Routine updated",
                    format!("{} was updated", routine.name),
                )
            },
            "Couldn't update the routine",
        );
        result
    }

    async fn update_inner(&self, routine: Routine) -> Result<Routine, SyncError> {
        self.engine.ensure_alive()?;
        let Some(routine_id) = routine.id.persisted() else {
            return Err(SyncError::TemporaryRoutine(routine.id.to_string()));
        };

        let now = Utc::now();
        let changed = self
            .backend
            .update(
                Table::Routines,
                &Filter::new().eq("id", routine_id),
                encode_row(&routine.patch(now))?,
            )
            .await
            .map_err(at(SaveStage::Routine))?;
        if changed == 0 {
            return Err(SyncError::NotFound {
                kind: "routine",
                id: routine.id.to_string(),
            });
        }

        let old_blocks = queries::query_blocks(self.backend.as_ref(), &[routine_id])
            .await
            .map_err(at(SaveStage::Blocks))?;
        let old_block_ids: Vec<i64> = old_blocks.iter().map(|block| block.id).collect();
        if !old_block_ids.is_empty() {
            self.backend
                .delete(
                    Table::BlockExercises,
                    &Filter::new().is_in("block_id", old_block_ids),
                )
                .await
                .map_err(at(SaveStage::Blocks))?;
        }
        self.backend
            .delete(
                Table::RoutineBlocks,
                &Filter::new().eq("routine_id", routine_id),
            )
            .await
            .map_err(at(SaveStage::Blocks))?;

        let blocks = self.insert_blocks(routine_id, &routine.blocks).await?;
        let updated = Routine {
            blocks,
            updated_at: Some(now),
            ..routine
        };
        self.engine.apply(Mutation::Update(updated.clone()))?;
        Ok(updated)
    }

    /// Delete a routine. Drafts only exist locally; for saved routines the dependent rows are
    /// cleaned up first, and only a failure to delete the routine row itself is fatal.
    pub async fn delete(&self, routine_id: &RoutineId) -> Result<(), SyncError> {
        let result = self.delete_inner(routine_id).await;
        self.engine.report(
            &result,
            |_| {
                Notification::success(
                    "Routine deleted",
                    format!("Routine {routine_id} was deleted"),
                )
            },
            "Couldn't delete the routine",
        );
        result
    }

    async fn delete_inner(&self, routine_id: &RoutineId) -> Result<(), SyncError> {
        self.engine.ensure_alive()?;
        let Some(id) = routine_id.persisted() else {
            self.engine.apply(Mutation::Remove(routine_id.clone()))?;
            return Ok(());
        };

        let by_routine = Filter::new().eq("routine_id", id);
        if let Err(e) = self
            .backend
            .delete(Table::RoutineAssignments, &by_routine)
            .await
        {
            log::warn!("Failed to delete assignments of routine {id}: {e}");
        }
        match queries::query_blocks(self.backend.as_ref(), &[id]).await {
            Ok(blocks) if !blocks.is_empty() => {
                let block_ids: Vec<i64> = blocks.iter().map(|block| block.id).collect();
                if let Err(e) = self
                    .backend
                    .delete(
                        Table::BlockExercises,
                        &Filter::new().is_in("block_id", block_ids),
                    )
                    .await
                {
                    log::warn!("Failed to delete exercises of routine {id}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to list blocks of routine {id}: {e}"),
        }
        if let Err(e) = self.backend.delete(Table::RoutineBlocks, &by_routine).await {
            log::warn!("Failed to delete blocks of routine {id}: {e}");
        }

        self.backend
            .delete(Table::Routines, &Filter::new().eq("id", id))
            .await?;
        self.engine.apply(Mutation::Remove(routine_id.clone()))?;
        Ok(())
    }

    /// Assign a saved routine to a student.
    pub async fn assign(
        &self,
        routine_id: &RoutineId,
        student_id: &str,
    ) -> Result<AssignmentRow, SyncError> {
        let result = self.assign_inner(routine_id, student_id).await;
        self.engine.report(
            &result,
            |_| {
                Notification::success(
                    "Routine assigned",
                    format!("Routine {routine_id} was assigned"),
                )
            },
            "Couldn't assign the routine",
        );
        result
    }

    async fn assign_inner(
        &self,
        routine_id: &RoutineId,
        student_id: &str,
    ) -> Result<AssignmentRow, SyncError> {
        self.engine.ensure_alive()?;
        let Some(id) = routine_id.persisted() else {
            return Err(SyncError::TemporaryRoutine(routine_id.to_string()));
        };
        let row = self
            .backend
            .insert(
                Table::RoutineAssignments,
                encode_row(&NewAssignment {
                    routine_id: id,
                    student_id: student_id.to_string(),
                    trainer_id: self.engine.owner_id().to_string(),
                })?,
            )
            .await?;
        Ok(decode_row(Table::RoutineAssignments, row)?)
    }
}
