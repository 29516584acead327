pub mod availability;
pub mod booking;
pub mod onboard;
pub mod search;
pub mod specialist;

use std::sync::Arc;

use usher_core::provider::ModelProvider;
use usher_core::retrieval::Retriever;

use crate::backends::{AppointmentBook, CustomerDirectory, SpecialistRoster};
use crate::registry::ToolRegistry;
use crate::summarize::SummarizeTool;

/// Everything the standard tool set needs, injected at construction.
pub struct ToolBackends {
    pub directory: Arc<dyn CustomerDirectory>,
    pub appointments: Arc<dyn AppointmentBook>,
    pub roster: Arc<dyn SpecialistRoster>,
    pub retriever: Arc<dyn Retriever>,
    pub provider: Arc<dyn ModelProvider>,
}

/// Build the registry with the full business tool set.
pub fn create_default_registry(backends: ToolBackends) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(onboard::OnboardCustomerTool::new(backends.directory)));
    registry.register(Arc::new(specialist::FindSpecialistTool::new(backends.roster)));
    registry.register(Arc::new(availability::CheckAvailabilityTool::new(
        Arc::clone(&backends.appointments),
    )));
    registry.register(Arc::new(booking::BookAppointmentTool::new(backends.appointments)));
    registry.register(Arc::new(search::SearchTool::case_studies(
        Arc::clone(&backends.retriever),
    )));
    registry.register(Arc::new(search::SearchTool::testimonials(backends.retriever)));
    registry.register(Arc::new(SummarizeTool::new(backends.provider)));
    registry
}
