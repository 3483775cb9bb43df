use std::time::Instant;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::record_operation;

use super::conflict::{validate_description, validate_duration, validate_name};
use super::{Engine, EngineError, Entity};

impl Engine {
    pub async fn create_category(
        &self,
        name: String,
        description: Option<String>,
    ) -> Result<Category, EngineError> {
        let started = Instant::now();
        let result = self.create_category_inner(name, description).await;
        record_operation("create_category", started, &result);
        result
    }

    async fn create_category_inner(
        &self,
        name: String,
        description: Option<String>,
    ) -> Result<Category, EngineError> {
        validate_name(&name)?;
        validate_description(description.as_deref())?;

        let id = Ulid::new();
        let event = Event::CategoryCreated {
            id,
            name,
            description,
        };
        self.persist_and_apply(event, Vec::new()).await?;
        let category = self
            .state
            .categories
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(Entity::Category, id))?;
        tracing::info!("category {} created: {}", category.id, category.name);
        Ok(category)
    }

    pub async fn create_service(&self, new: NewService) -> Result<Service, EngineError> {
        let started = Instant::now();
        let result = self.create_service_inner(new).await;
        record_operation("create_service", started, &result);
        result
    }

    async fn create_service_inner(&self, new: NewService) -> Result<Service, EngineError> {
        validate_name(&new.name)?;
        validate_description(new.description.as_deref())?;
        validate_duration(new.duration_minutes)?;
        if let Some(category_id) = new.category_id
            && !self.state.categories.contains_key(&category_id)
        {
            return Err(EngineError::NotFound(Entity::Category, category_id));
        }

        let service = Service {
            id: Ulid::new(),
            name: new.name,
            description: new.description,
            price: new.price,
            duration_minutes: new.duration_minutes,
            category_id: new.category_id,
        };
        let event = Event::ServiceCreated {
            service: service.clone(),
        };
        self.persist_and_apply(event, Vec::new()).await?;
        tracing::info!(
            "service {} created: {} ({} min)",
            service.id,
            service.name,
            service.duration_minutes
        );
        Ok(service)
    }

    pub fn get_service(&self, id: &Ulid) -> Result<Service, EngineError> {
        self.state.services
            .get(id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Service, *id))
    }

    /// All services in creation order.
    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.state.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn list_categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> =
            self.state.categories.iter().map(|e| e.value().clone()).collect();
        categories.sort_by_key(|c| c.id);
        categories
    }

    pub fn category(&self, id: &Ulid) -> Result<Category, EngineError> {
        self.state.categories
            .get(id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(Entity::Category, *id))
    }

    /// Services in a category, in creation order.
    pub fn services_by_category(&self, category_id: &Ulid) -> Result<Vec<Service>, EngineError> {
        if !self.state.categories.contains_key(category_id) {
            return Err(EngineError::NotFound(Entity::Category, *category_id));
        }
        let mut services: Vec<Service> = self
            .state
            .services
            .iter()
            .filter(|e| e.value().category_id == Some(*category_id))
            .map(|e| e.value().clone())
            .collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    /// The first `count` services of a category.
    pub fn top_services_by_category(
        &self,
        category_id: &Ulid,
        count: usize,
    ) -> Result<Vec<Service>, EngineError> {
        if count > MAX_TOP_SERVICES {
            return Err(EngineError::LimitExceeded("too many services requested"));
        }
        let mut services = self.services_by_category(category_id)?;
        services.truncate(count);
        Ok(services)
    }
}
