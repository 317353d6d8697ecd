use crate::common::models::{AddMembersOutcome, Group, GroupBrief, RemoveMembersOutcome, UserBrief};
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::users;
use sqlx::Row;
use std::sync::Arc;

/// Group-name collision predicate: case-insensitive substring containment in
/// either direction ("team" collides with "team A" and with "my team").
/// Deliberately a single named function so the matching rule can change
/// without touching call sites.
pub async fn name_conflicts(
    db: &Database,
    candidate: &str,
    exclude_group_id: Option<&str>,
) -> ServiceResult<bool> {
    let candidate = candidate.to_lowercase();
    let rows = sqlx::query("SELECT id, name FROM groups")
        .fetch_all(&db.pool)
        .await?;
    for row in rows {
        let id: String = row.get("id");
        if exclude_group_id == Some(id.as_str()) {
            continue;
        }
        let existing = row.get::<String, _>("name").to_lowercase();
        if existing.contains(&candidate) || candidate.contains(&existing) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn conflict_error(name: &str) -> ServiceError {
    let mut pretty = name.to_lowercase();
    if let Some(first) = pretty.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    ServiceError::conflict(format!("Group \"{}\" already exists", pretty))
}

pub async fn is_member(db: &Database, group_id: &str, user_id: &str) -> ServiceResult<bool> {
    let row = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.is_some())
}

pub async fn member_ids(db: &Database, group_id: &str) -> ServiceResult<Vec<String>> {
    let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ?")
        .bind(group_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("user_id")).collect())
}

pub async fn group_brief(db: &Database, group_id: &str) -> ServiceResult<GroupBrief> {
    let row = sqlx::query("SELECT id, name, image FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Group not found"))?;
    Ok(GroupBrief {
        id: row.get("id"),
        name: row.get("name"),
        image: row.get("image"),
    })
}

async fn fetch_group(db: &Database, group_id: &str) -> ServiceResult<Group> {
    let row = sqlx::query("SELECT id, name, image, admin_id, created_at FROM groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(&db.pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Group not found"))?;
    let members = sqlx::query(
        "SELECT u.id, u.username, u.profile_picture FROM group_members gm \
         JOIN users u ON u.id = gm.user_id WHERE gm.group_id = ? ORDER BY gm.joined_at ASC",
    )
    .bind(group_id)
    .fetch_all(&db.pool)
    .await?
    .iter()
    .map(|r| UserBrief {
        id: r.get("id"),
        username: r.get("username"),
        profile_picture: r.get("profile_picture"),
    })
    .collect();
    Ok(Group {
        id: row.get("id"),
        name: row.get("name"),
        image: row.get("image"),
        admin_id: row.get("admin_id"),
        members,
        created_at: row.get("created_at"),
    })
}

pub async fn create_group(
    db: Arc<Database>,
    name: &str,
    image: &str,
    member_ids: &[String],
    admin_id: &str,
) -> ServiceResult<Group> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(ServiceError::validation("Group name is required"));
    }
    if name_conflicts(&db, &name, None).await? {
        return Err(conflict_error(&name));
    }
    for user_id in member_ids {
        if !users::user_exists(&db, user_id).await? {
            return Err(ServiceError::not_found(format!(
                "User with id {} does not exist",
                user_id
            )));
        }
    }

    let group_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp_millis();
    let mut roster: Vec<&str> = member_ids.iter().map(String::as_str).collect();
    if !roster.contains(&admin_id) {
        roster.push(admin_id);
    }

    let mut tx = db.pool.begin().await?;
    sqlx::query("INSERT INTO groups (id, name, image, admin_id, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&group_id)
        .bind(&name)
        .bind(image)
        .bind(admin_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    for user_id in &roster {
        sqlx::query("INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(&group_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    log::info!("[GROUPS] Group '{}' created with id {} by {}", name, group_id, admin_id);
    fetch_group(&db, &group_id).await
}

pub async fn group_details(db: Arc<Database>, group_id: &str, caller: &str) -> ServiceResult<Group> {
    let group = fetch_group(&db, group_id).await?;
    if !group.members.iter().any(|m| m.id == caller) {
        return Err(ServiceError::forbidden("You are not a member of this group"));
    }
    Ok(group)
}

/// Per-id membership addition; partial success is reported, not failed.
pub async fn add_members(
    db: Arc<Database>,
    group_id: &str,
    user_ids: &[String],
    caller: &str,
) -> ServiceResult<(Group, AddMembersOutcome)> {
    if user_ids.is_empty() {
        return Err(ServiceError::validation("Please provide at least one user ID to add"));
    }
    let group = fetch_group(&db, group_id).await?;
    if group.admin_id != caller {
        return Err(ServiceError::forbidden("Only group admin can add users"));
    }

    let mut outcome = AddMembersOutcome::default();
    let now = chrono::Utc::now().timestamp_millis();
    for user_id in user_ids {
        if !users::user_exists(&db, user_id).await? {
            outcome.not_found.push(user_id.clone());
            continue;
        }
        if is_member(&db, group_id, user_id).await? {
            outcome.already_in_group.push(user_id.clone());
            continue;
        }
        sqlx::query("INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(group_id)
            .bind(user_id)
            .bind(now)
            .execute(&db.pool)
            .await?;
        outcome.added.push(user_id.clone());
    }
    log::info!(
        "[GROUPS] add_members on {}: added={} already={} missing={}",
        group_id,
        outcome.added.len(),
        outcome.already_in_group.len(),
        outcome.not_found.len()
    );
    Ok((fetch_group(&db, group_id).await?, outcome))
}

/// Per-id membership removal. The admin is never removed; such ids are
/// reported in their own bucket instead of erroring the batch.
pub async fn remove_members(
    db: Arc<Database>,
    group_id: &str,
    user_ids: &[String],
    caller: &str,
) -> ServiceResult<(Group, RemoveMembersOutcome)> {
    if user_ids.is_empty() {
        return Err(ServiceError::validation(
            "Please provide at least one user ID to remove",
        ));
    }
    let group = fetch_group(&db, group_id).await?;
    if group.admin_id != caller {
        return Err(ServiceError::forbidden(
            "Only the admin can remove users from the group",
        ));
    }

    let mut outcome = RemoveMembersOutcome::default();
    for user_id in user_ids {
        if !users::user_exists(&db, user_id).await? {
            outcome.not_found.push(user_id.clone());
            continue;
        }
        if !is_member(&db, group_id, user_id).await? {
            outcome.not_in_group.push(user_id.clone());
            continue;
        }
        if *user_id == group.admin_id {
            outcome.admin_cannot_remove_self.push(user_id.clone());
            continue;
        }
        sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&db.pool)
            .await?;
        outcome.removed.push(user_id.clone());
    }
    Ok((fetch_group(&db, group_id).await?, outcome))
}

/// Rename/restyle. Mirrors the observed behavior: without a name change the
/// call is a no-op (the image only updates alongside a rename).
pub async fn update_settings(
    db: Arc<Database>,
    group_id: &str,
    caller: &str,
    new_name: Option<&str>,
    new_image: Option<&str>,
) -> ServiceResult<Option<Group>> {
    let group = fetch_group(&db, group_id).await?;
    if group.admin_id != caller {
        return Err(ServiceError::forbidden("Only group admin can update group settings"));
    }

    let Some(new_name) = new_name else {
        return Ok(None);
    };
    let new_name = new_name.trim().to_lowercase();
    if new_name.is_empty() || new_name == group.name.to_lowercase() {
        return Ok(None);
    }
    if name_conflicts(&db, &new_name, Some(group_id)).await? {
        return Err(conflict_error(&new_name));
    }

    sqlx::query("UPDATE groups SET name = ?, image = COALESCE(?, image) WHERE id = ?")
        .bind(&new_name)
        .bind(new_image)
        .bind(group_id)
        .execute(&db.pool)
        .await?;
    log::info!("[GROUPS] Group {} renamed to '{}'", group_id, new_name);
    Ok(Some(fetch_group(&db, group_id).await?))
}

pub async fn list_user_groups(db: Arc<Database>, user_id: &str) -> ServiceResult<Vec<Group>> {
    let rows = sqlx::query(
        "SELECT g.id FROM groups g JOIN group_members gm ON g.id = gm.group_id \
         WHERE gm.user_id = ? ORDER BY g.created_at DESC",
    )
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;
    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        groups.push(fetch_group(&db, row.get("id")).await?);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::users::testutil::{memory_db, seed_user};

    async fn seeded() -> Arc<Database> {
        let db = memory_db().await;
        for (id, name) in [("a", "ada"), ("b", "bob"), ("c", "cam")] {
            seed_user(&db, id, name).await;
        }
        db
    }

    #[tokio::test]
    async fn admin_is_always_a_member() {
        let db = seeded().await;
        let group = create_group(db, "team", "", &["b".into()], "a").await.unwrap();
        assert_eq!(group.admin_id, "a");
        assert!(group.members.iter().any(|m| m.id == "a"));
        assert!(group.members.iter().any(|m| m.id == "b"));
    }

    #[tokio::test]
    async fn name_collision_is_substring_in_both_directions() {
        let db = seeded().await;
        create_group(db.clone(), "Team", "", &[], "a").await.unwrap();

        // New name contained in an existing one and vice versa both collide.
        let err = create_group(db.clone(), "my team", "", &[], "a").await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        let err = create_group(db.clone(), "Tea", "", &[], "a").await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(create_group(db, "squad", "", &[], "a").await.is_ok());
    }

    #[tokio::test]
    async fn create_with_unknown_member_is_not_found() {
        let db = seeded().await;
        let err = create_group(db, "team", "", &["ghost".into()], "a").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn only_admin_may_mutate_membership() {
        let db = seeded().await;
        let group = create_group(db.clone(), "team", "", &["b".into()], "a").await.unwrap();
        let err = add_members(db.clone(), &group.id, &["c".into()], "b").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
        let err = remove_members(db, &group.id, &["b".into()], "b").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn add_reports_partial_success() {
        let db = seeded().await;
        let group = create_group(db.clone(), "team", "", &["b".into()], "a").await.unwrap();
        let (group, outcome) = add_members(
            db,
            &group.id,
            &["b".into(), "c".into(), "ghost".into()],
            "a",
        )
        .await
        .unwrap();
        assert_eq!(outcome.added, vec!["c".to_string()]);
        assert_eq!(outcome.already_in_group, vec!["b".to_string()]);
        assert_eq!(outcome.not_found, vec!["ghost".to_string()]);
        assert_eq!(group.members.len(), 3);
    }

    #[tokio::test]
    async fn bulk_remove_never_removes_the_admin() {
        let db = seeded().await;
        let group = create_group(db.clone(), "team", "", &["b".into(), "c".into()], "a")
            .await
            .unwrap();
        let (group, outcome) = remove_members(
            db,
            &group.id,
            &["a".into(), "b".into(), "ghost".into()],
            "a",
        )
        .await
        .unwrap();
        assert_eq!(outcome.removed, vec!["b".to_string()]);
        assert_eq!(outcome.admin_cannot_remove_self, vec!["a".to_string()]);
        assert_eq!(outcome.not_found, vec!["ghost".to_string()]);
        assert!(group.members.iter().any(|m| m.id == "a"));
    }

    #[tokio::test]
    async fn settings_update_requires_a_name_change() {
        let db = seeded().await;
        let group = create_group(db.clone(), "team", "", &[], "a").await.unwrap();

        // No new name, or the same name, is a no-op.
        assert!(update_settings(db.clone(), &group.id, "a", None, Some("pic.png"))
            .await
            .unwrap()
            .is_none());
        assert!(update_settings(db.clone(), &group.id, "a", Some("TEAM"), None)
            .await
            .unwrap()
            .is_none());

        let updated = update_settings(db.clone(), &group.id, "a", Some("crew"), Some("pic.png"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "crew");
        assert_eq!(updated.image, "pic.png");

        let err = update_settings(db, &group.id, "b", Some("other"), None).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn list_user_groups_scopes_to_membership() {
        let db = seeded().await;
        create_group(db.clone(), "alpha", "", &["b".into()], "a").await.unwrap();
        create_group(db.clone(), "solo", "", &[], "c").await.unwrap();
        let groups = list_user_groups(db, "b").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "alpha");
    }
}
