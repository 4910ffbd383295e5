//! Forum operations: sections, threads and replies.

use agora_shared::constants::{MAX_REPLY_CHARS, MAX_THREAD_BODY_CHARS, MAX_THREAD_TITLE_CHARS};
use agora_shared::permission::{Container, PermissionLevel};
use agora_shared::protocol::ServerEvent;
use agora_shared::sanitize::{decode_entities, sanitize};
use agora_shared::types::{Identity, ReplyId, SectionId, ThreadId};
use agora_shared::{utc_now, UserSummary};
use agora_store::{Reply, Section, Thread};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::broker::Broker;
use crate::error::ServerError;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub id: ThreadId,
    pub section_id: SectionId,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub author: UserSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyView {
    pub id: ReplyId,
    pub thread_id: ThreadId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub author: UserSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    pub thread: ThreadView,
    pub replies: Vec<ReplyView>,
}

impl Broker {
    /// Level in an existing section; unknown sections are `NotFound`.
    fn section_level(
        &self,
        identity: &Identity,
        section: SectionId,
    ) -> Result<PermissionLevel, ServerError> {
        self.with_db(|db| {
            db.get_section(section)?;
            db.permission_for(Some(identity), Some(Container::Section(section)))
        })
        .map_err(|e| e.named("section"))
    }

    fn thread_in_view(&self, identity: &Identity, id: ThreadId) -> Result<(Thread, PermissionLevel), ServerError> {
        let thread = self
            .with_db(|db| db.get_thread(id))
            .map_err(|e| e.named("thread"))?;
        let level = self.section_level(identity, thread.section_id)?;
        if !level.can_view() {
            return Err(ServerError::PermissionDenied);
        }
        Ok((thread, level))
    }

    /// Sections the caller may view.
    pub fn list_sections(&self, identity: &Identity) -> Result<Vec<Section>, ServerError> {
        self.with_db(|db| {
            let mut visible = Vec::new();
            for section in db.list_sections()? {
                if db
                    .permission_for(Some(identity), Some(Container::Section(section.id)))?
                    .can_view()
                {
                    visible.push(section);
                }
            }
            Ok(visible)
        })
    }

    /// Threads in a section, newest first. Listing a section marks it read.
    pub fn list_threads(
        &self,
        identity: &Identity,
        section: SectionId,
    ) -> Result<Vec<ThreadView>, ServerError> {
        if !self.section_level(identity, section)?.can_view() {
            return Err(ServerError::PermissionDenied);
        }
        self.with_db(|db| {
            db.record_section_view(identity.user_id, section, utc_now())?;
            let mut views = Vec::new();
            for thread in db.list_threads(section)? {
                let author = db.get_user(thread.user_id)?.summary();
                views.push(thread_view(thread, author));
            }
            Ok(views)
        })
    }

    pub fn create_thread(
        &self,
        identity: &Identity,
        section: SectionId,
        title: &str,
        content: &str,
    ) -> Result<ThreadView, ServerError> {
        let title = required_text("title", title, MAX_THREAD_TITLE_CHARS)?;
        let content = required_text("content", content, MAX_THREAD_BODY_CHARS)?;
        if !self.section_level(identity, section)?.can_post() {
            return Err(ServerError::PermissionDenied);
        }

        let title = sanitized_text("title", title)?;
        let content = sanitized_text("content", content)?;
        let (thread, author) = self.with_db(|db| {
            let author = db.get_user(identity.user_id)?.summary();
            let thread = db.create_thread(identity.user_id, section, &title, &content, utc_now())?;
            Ok((thread, author))
        })?;
        info!(
            target: "audit",
            actor = %identity.user_id,
            section = %section,
            thread = %thread.id,
            "forum thread created"
        );
        Ok(thread_view(thread, author))
    }

    pub fn get_thread(&self, identity: &Identity, id: ThreadId) -> Result<ThreadDetail, ServerError> {
        let (thread, _) = self.thread_in_view(identity, id)?;
        self.with_db(|db| {
            let author = db.get_user(thread.user_id)?.summary();
            let mut replies = Vec::new();
            for reply in db.list_replies(id)? {
                let author = db.get_user(reply.user_id)?.summary();
                replies.push(reply_view(reply, author));
            }
            Ok(ThreadDetail {
                thread: thread_view(thread, author),
                replies,
            })
        })
    }

    pub fn create_reply(
        &self,
        identity: &Identity,
        thread: ThreadId,
        content: &str,
    ) -> Result<ReplyView, ServerError> {
        let content = required_text("content", content, MAX_REPLY_CHARS)?;
        let (_, level) = self.thread_in_view(identity, thread)?;
        if !level.can_post() {
            return Err(ServerError::PermissionDenied);
        }

        let content = sanitized_text("content", content)?;
        let (reply, author) = self.with_db(|db| {
            let author = db.get_user(identity.user_id)?.summary();
            let reply = db.create_reply(identity.user_id, thread, &content, utc_now())?;
            Ok((reply, author))
        })?;
        info!(
            target: "audit",
            actor = %identity.user_id,
            thread = %thread,
            reply = %reply.id,
            "forum reply created"
        );
        Ok(reply_view(reply, author))
    }

    /// Delete a thread and all of its replies, then tell every connection.
    pub async fn delete_thread(&self, identity: &Identity, id: ThreadId) -> Result<(), ServerError> {
        let (thread, level) = self.thread_in_view(identity, id)?;
        if !level.can_delete(thread.user_id == identity.user_id) {
            return Err(ServerError::PermissionDenied);
        }

        let replies = self
            .with_db(|db| db.delete_thread(id))
            .map_err(|e| e.named("thread"))?;
        info!(
            target: "audit",
            actor = %identity.user_id,
            author = %thread.user_id,
            section = %thread.section_id,
            thread = %id,
            replies,
            "forum thread deleted"
        );

        self.hub()
            .broadcast_all(ServerEvent::ThreadDeleted {
                id,
                section_id: thread.section_id,
                deleted_by: identity.user_id,
                timestamp: utc_now(),
            })
            .await;
        Ok(())
    }

    pub async fn delete_reply(&self, identity: &Identity, id: ReplyId) -> Result<(), ServerError> {
        let reply = self
            .with_db(|db| db.get_reply(id))
            .map_err(|e| e.named("reply"))?;
        let (thread, level) = self.thread_in_view(identity, reply.thread_id)?;
        if !level.can_delete(reply.user_id == identity.user_id) {
            return Err(ServerError::PermissionDenied);
        }

        if !self.with_db(|db| db.delete_reply(id))? {
            return Err(ServerError::NotFound("reply"));
        }
        info!(
            target: "audit",
            actor = %identity.user_id,
            author = %reply.user_id,
            thread = %thread.id,
            reply = %id,
            "forum reply deleted"
        );

        self.hub()
            .broadcast_all(ServerEvent::ReplyDeleted {
                id,
                thread_id: thread.id,
                section_id: thread.section_id,
                deleted_by: identity.user_id,
                timestamp: utc_now(),
            })
            .await;
        Ok(())
    }
}

/// Trimmed, non-empty and at most `max` characters.
fn required_text<'a>(field: &str, raw: &'a str, max: usize) -> Result<&'a str, ServerError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ServerError::validation(format!("{field} is required")));
    }
    if text.chars().count() > max {
        return Err(ServerError::validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(text)
}

/// Text that sanitizes to nothing is refused rather than stored empty.
fn sanitized_text(field: &str, text: &str) -> Result<String, ServerError> {
    let clean = sanitize(text);
    if clean.trim().is_empty() {
        return Err(ServerError::validation(format!("{field} is empty")));
    }
    Ok(clean)
}

fn thread_view(thread: Thread, author: UserSummary) -> ThreadView {
    ThreadView {
        id: thread.id,
        section_id: thread.section_id,
        title: decode_entities(&thread.title),
        content: decode_entities(&thread.content),
        timestamp: thread.timestamp,
        author,
    }
}

fn reply_view(reply: Reply, author: UserSummary) -> ReplyView {
    ReplyView {
        id: reply.id,
        thread_id: reply.thread_id,
        content: decode_entities(&reply.content),
        timestamp: reply.timestamp,
        author,
    }
}
