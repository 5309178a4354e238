//! Fan-out of presence events. Presence is advisory and latest-value-wins, so nothing here is
//! ordered against document operations or retried.

use std::collections::HashMap;

use crate::models::{CursorPositionEvent, SelectionChangeEvent, SendMessage, UserPresenceEvent};
use super::participant::{ParticipantSession, SendFailure};

pub fn user_joined(session: &ParticipantSession) -> SendMessage {
    SendMessage::UserJoined(UserPresenceEvent {
        participant_id: session.participant_id.clone(),
        display_name: session.display_name.clone(),
    })
}

pub fn user_left(session: &ParticipantSession) -> SendMessage {
    SendMessage::UserLeft(UserPresenceEvent {
        participant_id: session.participant_id.clone(),
        display_name: session.display_name.clone(),
    })
}

pub fn cursor(session: &ParticipantSession) -> Option<SendMessage> {
    session.cursor_position.map(|position| {
        SendMessage::CursorPosition(CursorPositionEvent {
            participant_id: session.participant_id.clone(),
            position,
        })
    })
}

/// Selection event for `session`; a cleared selection is sent as null bounds.
pub fn selection(session: &ParticipantSession) -> SendMessage {
    SendMessage::SelectionChange(SelectionChangeEvent {
        participant_id: session.participant_id.clone(),
        start: session.selection.map(|s| s.start),
        end: session.selection.map(|s| s.end),
    })
}

/// Presence of everyone but `joiner`, in the order a fresh client needs it.
pub fn presence_of_others(participants: &HashMap<String, ParticipantSession>, joiner: &str) -> Vec<SendMessage> {
    let mut messages = Vec::new();
    for session in participants.values() {
        if session.participant_id == joiner || !session.is_active() {
            continue;
        }
        messages.push(user_joined(session));
        if let Some(msg) = cursor(session) {
            messages.push(msg);
        }
        if session.selection.is_some() {
            messages.push(selection(session));
        }
    }
    messages
}

/// Queue `msg` for every active participant except `except`.
///
/// Returns the participants whose connection failed (queue full or closed).
pub fn fan_out(
    participants: &HashMap<String, ParticipantSession>,
    except: Option<&str>,
    msg: &SendMessage,
) -> Vec<String> {
    let mut failed = Vec::new();
    for (participant_id, session) in participants {
        if Some(participant_id.as_str()) == except || !session.is_active() {
            continue;
        }
        match session.send(msg) {
            Ok(()) | Err(SendFailure::Detached) => {}
            Err(SendFailure::Overflow) | Err(SendFailure::Closed) => failed.push(participant_id.clone()),
        }
    }
    failed
}
