//! Scripted engine transport for service, scheduler and router tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bsync_core::{
    DispatchRequest, EngineId, EngineResponse, EngineSpec, SyncError, UserContext, parse_reply,
};
use serde_json::{Value, json};

use crate::client::EngineTransport;

#[derive(Debug, Clone)]
pub enum Script {
    /// Answer 200 with this body.
    Reply(Value),
    /// Answer with this status.
    Status(u16),
    /// Fail before any response.
    Refuse,
}

#[derive(Default)]
pub struct MockTransport {
    sends: Mutex<HashMap<EngineId, Script>>,
    healthy: Mutex<HashMap<EngineId, bool>>,
    calls: Mutex<Vec<(EngineId, uuid::Uuid)>>,
    contexts: Mutex<Vec<UserContext>>,
}

impl MockTransport {
    /// Every engine accepts with an empty reply and every health check passes.
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn script(&self, engine: EngineId, script: Script) {
        self.sends.lock().unwrap().insert(engine, script);
    }

    pub fn set_healthy(&self, engine: EngineId, healthy: bool) {
        self.healthy.lock().unwrap().insert(engine, healthy);
    }

    pub fn calls_to(&self, engine: EngineId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == engine)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_context(&self) -> Option<UserContext> {
        self.contexts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl EngineTransport for MockTransport {
    async fn send(
        &self,
        engine: &EngineSpec,
        request: &DispatchRequest,
    ) -> Result<EngineResponse, SyncError> {
        self.calls
            .lock()
            .unwrap()
            .push((engine.id, request.event.id()));
        self.contexts
            .lock()
            .unwrap()
            .push(request.user_context.clone());

        let script = self
            .sends
            .lock()
            .unwrap()
            .get(&engine.id)
            .cloned()
            .unwrap_or(Script::Reply(json!({})));
        match script {
            Script::Reply(body) => {
                let reply = parse_reply(200, &body.to_string())?;
                Ok(EngineResponse::ok(reply, 0.01))
            }
            Script::Status(status) => Err(parse_reply(status, "scripted").unwrap_err()),
            Script::Refuse => Err(SyncError::Transport("connection refused".into())),
        }
    }

    async fn health(&self, engine: &EngineSpec, _timeout: Duration) -> Result<f64, SyncError> {
        let healthy = self
            .healthy
            .lock()
            .unwrap()
            .get(&engine.id)
            .copied()
            .unwrap_or(true);
        if healthy {
            Ok(0.002)
        } else {
            Err(SyncError::Transport("connection refused".into()))
        }
    }
}
