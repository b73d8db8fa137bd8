//! Typed dispatch of client events to the orchestrator, task manager and
//! scheduler. Errors scoped to one request go back to the requesting
//! window only; everything else rides the broadcast bus.

use std::sync::Arc;

use tracing::warn;

use maestro_core::events::{ClientEvent, ServerEvent};
use maestro_core::ids::{SessionId, WindowId};
use maestro_core::schedule::{CreateSchedule, SchedulePatch};
use maestro_core::session::SessionPatch;

use crate::orchestrator::{SessionOrchestrator, StartSession};
use crate::scheduler::Scheduler;
use crate::tasks::TaskManager;
use crate::windows::WindowRegistry;

/// Shared state available to the dispatcher.
pub struct HandlerState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub tasks: Arc<TaskManager>,
    pub scheduler: Arc<Scheduler>,
    pub windows: Arc<WindowRegistry>,
}

/// Report a failure to the requesting window only.
async fn report_error(
    state: &HandlerState,
    window_id: &WindowId,
    session_id: Option<SessionId>,
    message: String,
) {
    let event = ServerEvent::RunnerError { session_id, message };
    match serde_json::to_string(&event) {
        Ok(json) => {
            state.windows.send_to(window_id, json).await;
        }
        Err(e) => warn!(error = %e, "failed to serialize error event"),
    }
}

/// Handle one client event from one window.
pub async fn dispatch(state: &Arc<HandlerState>, window_id: &WindowId, event: ClientEvent) {
    match event {
        ClientEvent::SessionStart { prompt, title, cwd, model, temperature } => {
            match state
                .orchestrator
                .start_session(StartSession { title, prompt, cwd, model, temperature })
                .await
            {
                Ok(session) => {
                    // The window that started a session follows it.
                    state.windows.subscribe(window_id, session.id).await;
                }
                Err(e) => report_error(state, window_id, None, e.to_string()).await,
            }
        }

        ClientEvent::SessionContinue { session_id, prompt } => {
            if let Err(e) = state.orchestrator.continue_session(&session_id, prompt).await {
                report_error(state, window_id, Some(session_id), e.to_string()).await;
            }
        }

        ClientEvent::SessionStop { session_id } => {
            if !state.orchestrator.stop_session(&session_id) {
                warn!(session_id = %session_id, "stop requested for session with no live runner");
            }
        }

        ClientEvent::SessionDelete { session_id } => {
            if let Err(e) = state.orchestrator.delete_session(&session_id).await {
                report_error(state, window_id, Some(session_id), e.to_string()).await;
            }
        }

        ClientEvent::SessionPin { session_id, is_pinned } => {
            if let Err(e) = state.orchestrator.pin_session(&session_id, is_pinned) {
                report_error(state, window_id, Some(session_id), e.to_string()).await;
            }
        }

        ClientEvent::SessionUpdate { session_id, title, model, cwd } => {
            let patch = SessionPatch { title, model, cwd, ..Default::default() };
            if let Err(e) = state.orchestrator.update_session(&session_id, &patch) {
                report_error(state, window_id, Some(session_id), e.to_string()).await;
            }
        }

        ClientEvent::SessionHistory { session_id, limit, before } => {
            // History is the subscription point: the requesting window now
            // follows this session, and the reply goes to it alone.
            state.windows.subscribe(window_id, session_id.clone()).await;
            match state.orchestrator.history_event(&session_id, limit, before) {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        state.windows.send_to(window_id, json).await;
                    }
                    Err(e) => warn!(error = %e, "failed to serialize history"),
                },
                Err(e) => {
                    report_error(state, window_id, Some(session_id), e.to_string()).await;
                }
            }
        }

        ClientEvent::SessionList => {
            state.orchestrator.emit_session_list();
        }

        ClientEvent::PermissionResponse { session_id, tool_call_id, approved } => {
            if let Err(e) = state
                .orchestrator
                .resolve_permission(&session_id, &tool_call_id, approved)
            {
                // Orphan response: logged and dropped, never fatal.
                warn!(session_id = %session_id, error = %e, "orphan permission response");
            }
        }

        ClientEvent::MessageEdit { session_id, message_index, new_prompt } => {
            if let Err(e) = state
                .orchestrator
                .edit_message(&session_id, message_index, new_prompt)
                .await
            {
                report_error(state, window_id, Some(session_id), e.to_string()).await;
            }
        }

        ClientEvent::TaskCreate { title, mode, cwd, fanout } => {
            if let Err(e) = state.tasks.create(&title, mode, cwd, fanout).await {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::TaskStart { task_id } => {
            if let Err(e) = state.tasks.start(&task_id).await {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::TaskDelete { task_id } => {
            if let Err(e) = state.tasks.delete(&task_id).await {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::ScheduleCreate { title, prompt, schedule, notify_before } => {
            let params = CreateSchedule { title, prompt, schedule, notify_before };
            if let Err(e) = state.scheduler.create(&params) {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::ScheduleUpdate {
            schedule_id,
            title,
            prompt,
            schedule,
            notify_before,
            enabled,
        } => {
            let patch = SchedulePatch {
                title,
                prompt,
                schedule,
                notify_before,
                enabled,
                ..Default::default()
            };
            if let Err(e) = state.scheduler.update(&schedule_id, &patch) {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::ScheduleDelete { schedule_id } => {
            if let Err(e) = state.scheduler.delete(&schedule_id) {
                report_error(state, window_id, None, e.to_string()).await;
            }
        }

        ClientEvent::ScheduleList => {
            state.scheduler.emit_list();
        }
    }
}
