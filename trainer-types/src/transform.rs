use std::collections::{BTreeMap, HashMap};

use crate::rows::{
    BlockExerciseRow, BlockRow, GuestRow, ProfileRow, RelationshipRow, RequestRow, RequestStatus,
    RoutineRow,
};
use crate::{Block, BlockExercise, Client, ClientOrigin, ClientStatus, Routine, RoutineId};

pub const UNKNOWN_CLIENT_NAME: &str = "Unknown client";

/// Joins the roster's rows into one list: confirmed members in backend order, then pending
/// requests, then guests.
///
/// Requests that are no longer pending are skipped. A pending request from a student who is
/// already a member is still listed, so the roster matches the backend's pending count.
pub fn build_roster(
    relationships: &[RelationshipRow],
    requests: &[RequestRow],
    profiles: &[ProfileRow],
    guests: &[GuestRow],
) -> Vec<Client> {
    let profiles: HashMap<&str, &ProfileRow> = profiles
        .iter()
        .map(|profile| (profile.id.as_str(), profile))
        .collect();
    let confirmed = relationships.iter().map(|relationship| {
        member_client(
            relationship,
            profiles.get(relationship.student_id.as_str()).copied(),
        )
    });
    let pending = requests
        .iter()
        .filter(|request| request.status == RequestStatus::Pending)
        .map(|request| {
            request_client(request, profiles.get(request.student_id.as_str()).copied())
        });
    let guests = guests.iter().map(guest_client);

    confirmed.chain(pending).chain(guests).collect()
}

pub fn member_client(relationship: &RelationshipRow, profile: Option<&ProfileRow>) -> Client {
    let (name, email, avatar, plan) = display_fields(profile);
    Client {
        id: Client::member_id(relationship.id),
        user_id: Some(relationship.student_id.clone()),
        relationship_id: Some(relationship.id),
        request_id: None,
        requested_by: None,
        guest_id: None,
        status: relationship.status,
        origin: ClientOrigin::Roster,
        name,
        email,
        avatar,
        join_date: relationship.created_at,
        plan,
        progress: 0,
        sessions_completed: 0,
    }
}

pub fn request_client(request: &RequestRow, profile: Option<&ProfileRow>) -> Client {
    let (name, email, avatar, plan) = display_fields(profile);
    Client {
        id: Client::request_key(request.id),
        user_id: Some(request.student_id.clone()),
        relationship_id: None,
        request_id: Some(request.id),
        requested_by: Some(request.requested_by.clone()),
        guest_id: None,
        status: ClientStatus::Pending,
        origin: ClientOrigin::Request,
        name,
        email,
        avatar,
        join_date: request.created_at,
        plan,
        progress: 0,
        sessions_completed: 0,
    }
}

pub fn guest_client(guest: &GuestRow) -> Client {
    Client {
        id: Client::guest_key(guest.id),
        user_id: None,
        relationship_id: None,
        request_id: None,
        requested_by: None,
        guest_id: Some(guest.id),
        status: guest.status,
        origin: ClientOrigin::Guest,
        name: guest.full_name.clone(),
        email: guest.email.clone(),
        avatar: None,
        join_date: guest.created_at,
        plan: guest.plan.clone(),
        progress: 0,
        sessions_completed: 0,
    }
}

fn display_fields(
    profile: Option<&ProfileRow>,
) -> (String, Option<String>, Option<String>, Option<String>) {
    match profile {
        Some(profile) => (
            profile
                .full_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_CLIENT_NAME.to_string()),
            profile.email.clone(),
            profile.avatar_url.clone(),
            profile.plan.clone(),
        ),
        None => (UNKNOWN_CLIENT_NAME.to_string(), None, None, None),
    }
}

/// Assembles routines from their three tables. Routines keep the order they were given in;
/// blocks and exercises are sorted by their `order` column, ties keep arrival order.
pub fn build_routines(
    routines: &[RoutineRow],
    blocks: &[BlockRow],
    exercises: &[BlockExerciseRow],
) -> Vec<Routine> {
    let mut exercises_by_block: BTreeMap<i64, Vec<&BlockExerciseRow>> = BTreeMap::new();
    for exercise in exercises {
        exercises_by_block
            .entry(exercise.block_id)
            .or_default()
            .push(exercise);
    }

    let mut blocks_by_routine: BTreeMap<i64, Vec<&BlockRow>> = BTreeMap::new();
    for block in blocks {
        blocks_by_routine
            .entry(block.routine_id)
            .or_default()
            .push(block);
    }

    routines
        .iter()
        .map(|routine| {
            let mut rows = blocks_by_routine.remove(&routine.id).unwrap_or_default();
            rows.sort_by_key(|block| block.order);
            let blocks = rows
                .into_iter()
                .map(|block| {
                    let mut rows = exercises_by_block.remove(&block.id).unwrap_or_default();
                    rows.sort_by_key(|exercise| exercise.order);
                    Block {
                        id: Some(block.id),
                        name: block.name.clone(),
                        order: block.order,
                        exercises: rows.into_iter().map(exercise_from_row).collect(),
                    }
                })
                .collect();

            Routine {
                id: RoutineId::Persisted(routine.id),
                name: routine.name.clone(),
                description: routine.description.clone(),
                blocks,
                created_at: routine.created_at,
                updated_at: routine.updated_at,
            }
        })
        .collect()
}

fn exercise_from_row(row: &BlockExerciseRow) -> BlockExercise {
    BlockExercise {
        id: Some(row.id),
        name: row.name.clone(),
        sets: row.sets,
        reps: row.reps.clone(),
        rest_seconds: row.rest_seconds,
        notes: row.notes.clone(),
        order: row.order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn relationship(id: i64, student: &str) -> RelationshipRow {
        RelationshipRow {
            id,
            trainer_id: "trainer".to_string(),
            student_id: student.to_string(),
            status: ClientStatus::Active,
            created_at: at(id),
        }
    }

    fn request(id: i64, student: &str, requested_by: &str) -> RequestRow {
        RequestRow {
            id,
            trainer_id: "trainer".to_string(),
            student_id: student.to_string(),
            requested_by: requested_by.to_string(),
            status: RequestStatus::Pending,
            created_at: at(100 + id),
        }
    }

    fn profile(id: &str, name: &str) -> ProfileRow {
        ProfileRow {
            id: id.to_string(),
            full_name: Some(name.to_string()),
            email: Some(format!("{id}@example.com")),
            avatar_url: None,
            plan: None,
        }
    }

    fn guest(id: i64, name: &str) -> GuestRow {
        GuestRow {
            id,
            trainer_id: "trainer".to_string(),
            full_name: name.to_string(),
            email: None,
            plan: Some("monthly".to_string()),
            status: ClientStatus::Active,
            created_at: at(200 + id),
        }
    }

    #[test]
    fn test_roster_orders_members_then_requests_then_guests() {
        let roster = build_roster(
            &[relationship(1, "ana"), relationship(2, "ben")],
            &[request(7, "cai", "cai")],
            &[profile("ana", "Ana"), profile("ben", "Ben"), profile("cai", "Cai")],
            &[guest(3, "Dee")],
        );

        let ids: Vec<&str> = roster.iter().map(|client| client.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "request-7", "guest-3"]);
        assert_eq!(roster[0].name, "Ana");
        assert_eq!(roster[0].user_id.as_deref(), Some("ana"));
        assert_eq!(roster[2].origin, ClientOrigin::Request);
        assert!(roster[2].requested_by_user("cai"));
        assert!(roster[3].is_guest());
        assert_eq!(roster[3].user_id, None);
    }

    #[test]
    fn test_pending_iff_request_without_relationship() {
        let roster = build_roster(
            &[relationship(1, "ana")],
            &[request(7, "cai", "trainer"), request(8, "dan", "dan")],
            &[],
            &[guest(3, "Dee")],
        );

        for client in &roster {
            let pending = client.request_id.is_some() && client.relationship_id.is_none();
            assert_eq!(client.is_pending(), pending, "client {}", client.id);
            assert_ne!(Some(client.id.as_str()), client.user_id.as_deref());
        }
        assert_eq!(roster.iter().filter(|client| client.is_pending()).count(), 2);
    }

    #[test]
    fn test_missing_profile_gets_placeholder_name() {
        let roster = build_roster(&[relationship(1, "ghost")], &[], &[], &[]);
        assert_eq!(roster[0].name, UNKNOWN_CLIENT_NAME);
        assert_eq!(roster[0].progress, 0);
        assert_eq!(roster[0].sessions_completed, 0);
    }

    #[test]
    fn test_answered_requests_are_skipped() {
        let mut answered = request(9, "eve", "eve");
        answered.status = RequestStatus::Rejected;
        let roster = build_roster(&[relationship(1, "ana")], &[answered], &[], &[]);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_stale_request_from_a_member_is_still_listed() {
        let roster = build_roster(
            &[relationship(1, "ana")],
            &[request(7, "ana", "ana")],
            &[profile("ana", "Ana")],
            &[],
        );

        let ids: Vec<&str> = roster.iter().map(|client| client.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "request-7"]);
        assert_eq!(roster[1].name, "Ana");
        assert!(roster[1].is_pending());
    }

    #[test]
    fn test_roster_transform_is_idempotent() {
        let relationships = [relationship(1, "ana"), relationship(2, "ben")];
        let requests = [request(7, "cai", "cai")];
        let profiles = [profile("ana", "Ana")];
        let guests = [guest(3, "Dee")];

        assert_eq!(
            build_roster(&relationships, &requests, &profiles, &guests),
            build_roster(&relationships, &requests, &profiles, &guests)
        );
    }

    fn routine_row(id: i64) -> RoutineRow {
        RoutineRow {
            id,
            trainer_id: "trainer".to_string(),
            name: format!("Routine {id}"),
            description: None,
            created_at: at(id),
            updated_at: None,
        }
    }

    fn block_row(id: i64, routine_id: i64, name: &str, order: u32) -> BlockRow {
        BlockRow {
            id,
            routine_id,
            name: name.to_string(),
            order,
        }
    }

    fn exercise_row(id: i64, block_id: i64, name: &str, order: u32) -> BlockExerciseRow {
        BlockExerciseRow {
            id,
            block_id,
            name: name.to_string(),
            sets: 3,
            reps: "10".to_string(),
            rest_seconds: Some(60),
            notes: None,
            order,
        }
    }

    #[test]
    fn test_routines_sort_by_explicit_order_not_arrival() {
        let routines = [routine_row(42)];
        let blocks = [
            block_row(11, 42, "B1", 1),
            block_row(10, 42, "B2", 0),
        ];
        let exercises = [
            exercise_row(3, 10, "Squat", 2),
            exercise_row(1, 10, "Lunge", 0),
            exercise_row(2, 10, "Press", 1),
            exercise_row(4, 11, "Row", 0),
        ];

        let built = build_routines(&routines, &blocks, &exercises);
        let names: Vec<&str> = built[0].blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["B2", "B1"]);
        let first: Vec<&str> = built[0].blocks[0]
            .exercises
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(first, vec!["Lunge", "Press", "Squat"]);
        assert_eq!(built[0].exercise_count(), 4);

        let mut shuffled_exercises = exercises.clone();
        shuffled_exercises.reverse();
        let mut shuffled_blocks = blocks.clone();
        shuffled_blocks.reverse();
        assert_eq!(
            build_routines(&routines, &shuffled_blocks, &shuffled_exercises),
            built
        );
    }

    #[test]
    fn test_routines_keep_backend_order_and_ignore_orphans() {
        let routines = [routine_row(2), routine_row(1)];
        let blocks = [block_row(10, 99, "orphan", 0)];
        let built = build_routines(&routines, &blocks, &[]);

        let ids: Vec<RoutineId> = built.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![RoutineId::Persisted(2), RoutineId::Persisted(1)]);
        assert!(built.iter().all(|r| r.blocks.is_empty()));
    }
}
