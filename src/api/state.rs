use std::sync::Arc;

use crate::detect::engine::DetectionEngine;
use crate::ingest::IngestService;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub engine: Arc<DetectionEngine>,
    pub ingest: Arc<IngestService>,
}
