use std::collections::HashSet;
use std::sync::Arc;

use chrono::Weekday;
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_span, validate_text};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_profile(
        &self,
        id: Ulid,
        kind: ResourceKind,
        timezone: Tz,
    ) -> Result<(), EngineError> {
        if self.profiles.len() >= MAX_PROFILES {
            return Err(EngineError::LimitExceeded("too many profiles"));
        }
        if self.profiles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let ResourceKind::Employee { company_id, .. } = kind {
            if company_id == id {
                return Err(EngineError::validation("company_id", "employee cannot be its own company"));
            }
            let company = self.require_profile(&company_id)?;
            if company.read().await.kind != ResourceKind::Company {
                return Err(EngineError::validation(
                    "company_id",
                    format!("{company_id} is not a company"),
                ));
            }
        }

        let event = Event::ProfileCreated { id, kind, timezone };
        self.wal_append(&event).await?;
        if let ResourceKind::Employee { company_id, .. } = kind {
            self.company_of.insert(id, company_id);
        }
        self.profiles.insert(
            id,
            Arc::new(RwLock::new(AvailabilityProfile::new(id, kind, timezone))),
        );
        info!(profile = %id, tz = %timezone, "profile created");
        Ok(())
    }

    pub async fn set_weekday(
        &self,
        resource_id: Ulid,
        weekday: Weekday,
        schedule: DaySchedule,
    ) -> Result<(), EngineError> {
        if !schedule.is_valid() {
            return Err(EngineError::validation(
                "weekly_hours",
                format!("{weekday}: start must be before end"),
            ));
        }
        let profile = self.require_profile(&resource_id)?;
        let mut guard = profile.write().await;
        let event = Event::WeekdaySet {
            resource_id,
            weekday,
            schedule,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Set several weekdays at once. All rows are validated before any is written.
    pub async fn set_weekdays(
        &self,
        rows: Vec<(Ulid, Weekday, DaySchedule)>,
    ) -> Result<(), EngineError> {
        if rows.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (resource_id, weekday, schedule) in &rows {
            if !schedule.is_valid() {
                return Err(EngineError::validation(
                    "weekly_hours",
                    format!("{weekday}: start must be before end"),
                ));
            }
            if !self.profiles.contains_key(resource_id) {
                return Err(EngineError::NotFound(*resource_id));
            }
        }
        for (resource_id, weekday, schedule) in rows {
            self.set_weekday(resource_id, weekday, schedule).await?;
        }
        Ok(())
    }

    pub async fn set_preference(
        &self,
        resource_id: Ulid,
        preference: AvailabilityPreference,
    ) -> Result<(), EngineError> {
        let profile = self.require_profile(&resource_id)?;
        let mut guard = profile.write().await;
        if guard.kind == ResourceKind::Company {
            return Err(EngineError::validation(
                "preference",
                "only employees inherit availability",
            ));
        }
        let event = Event::PreferenceChanged {
            resource_id,
            preference,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_blocked_range(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if span.start > span.end {
            return Err(EngineError::validation("span", "start after end"));
        }
        if let Some(r) = &reason {
            validate_text("reason", r, MAX_REASON_LEN)?;
        }
        if self.block_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let profile = self.require_profile(&resource_id)?;
        let mut guard = profile.write().await;
        if guard.block_count() >= MAX_BLOCKS_PER_PROFILE {
            return Err(EngineError::LimitExceeded("too many blocks on profile"));
        }
        let event = Event::BlockAdded {
            resource_id,
            block: BlockedRange { id, span, reason },
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a manual block. Returns the profile it was on.
    pub async fn remove_blocked_range(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let resource_id = self
            .block_to_resource
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let profile = self.require_profile(&resource_id)?;
        let mut guard = profile.write().await;
        let event = Event::BlockRemoved { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Publish a project. Pool sizing (`min_resources`, overlap, unknown ids)
    /// is checked when proposals are computed, not here.
    pub async fn publish_project(&self, project: Project) -> Result<(), EngineError> {
        if self.projects.contains_key(&project.id) {
            return Err(EngineError::AlreadyExists(project.id));
        }
        let company = self.require_profile(&project.company_id)?;
        if company.read().await.kind != ResourceKind::Company {
            return Err(EngineError::validation(
                "company_id",
                format!("{} is not a company", project.company_id),
            ));
        }
        validate_text("category", &project.category, MAX_NAME_LEN)?;
        if project.subprojects.is_empty() {
            return Err(EngineError::validation("subprojects", "at least one required"));
        }
        if project.subprojects.len() > MAX_SUBPROJECTS {
            return Err(EngineError::LimitExceeded("too many subprojects"));
        }
        for sub in &project.subprojects {
            self.validate_subproject(&project, sub)?;
        }

        let id = project.id;
        self.wal_append(&Event::ProjectPublished {
            project: project.clone(),
        })
        .await?;
        self.projects.insert(id, Arc::new(project));
        info!(project = %id, "project published");
        Ok(())
    }

    fn validate_subproject(&self, project: &Project, sub: &Subproject) -> Result<(), EngineError> {
        validate_text("name", &sub.name, MAX_NAME_LEN)?;
        if sub.execution.value == 0 {
            return Err(EngineError::validation("execution", "must be positive"));
        }
        if sub.intake.is_some() && !project.is_renovation() {
            return Err(EngineError::validation(
                "intake",
                "only renovation projects have an intake period",
            ));
        }
        if let Some(intake) = sub.intake
            && intake.value == 0
        {
            return Err(EngineError::validation("intake", "must be positive"));
        }
        if sub.resources.len() > MAX_POOL_SIZE {
            return Err(EngineError::LimitExceeded("resource pool too large"));
        }
        for id in &sub.resources {
            let belongs = *id == project.company_id
                || self
                    .company_of
                    .get(id)
                    .is_some_and(|c| *c.value() == project.company_id);
            if self.profiles.contains_key(id) && !belongs {
                return Err(EngineError::validation(
                    "resources",
                    format!("{id} does not belong to company {}", project.company_id),
                ));
            }
        }

        if sub.professional_inputs.len() > MAX_PROFESSIONAL_INPUTS {
            return Err(EngineError::LimitExceeded("too many professional inputs"));
        }
        let mut names = HashSet::new();
        for input in &sub.professional_inputs {
            validate_text("professional_inputs", input.name(), MAX_NAME_LEN)?;
            if !names.insert(input.name()) {
                return Err(EngineError::validation(
                    "professional_inputs",
                    format!("duplicate field {:?}", input.name()),
                ));
            }
            match input {
                ProfessionalInput::Dropdown {
                    options, selected, ..
                } => {
                    if let Some(s) = selected
                        && !options.contains(s)
                    {
                        return Err(EngineError::validation(
                            "professional_inputs",
                            format!("{s:?} is not one of the options"),
                        ));
                    }
                }
                ProfessionalInput::Range { name, min, max } => {
                    if !(min.is_finite() && max.is_finite() && min <= max) {
                        return Err(EngineError::validation(
                            "professional_inputs",
                            format!("{name}: range min must not exceed max"),
                        ));
                    }
                }
                ProfessionalInput::Number { name, value, .. } => {
                    if !value.is_finite() {
                        return Err(EngineError::validation(
                            "professional_inputs",
                            format!("{name}: not a finite number"),
                        ));
                    }
                }
                ProfessionalInput::Text { value, .. } => {
                    validate_text("professional_inputs", value, MAX_DESCRIPTION_LEN)?;
                }
            }
        }

        match &sub.pricing {
            Pricing::Fixed { amount_cents } if *amount_cents == 0 => {
                Err(EngineError::validation("pricing", "fixed amount must be positive"))
            }
            Pricing::Unit {
                price_per_unit_cents,
                quantity_field,
                ..
            } => {
                if *price_per_unit_cents == 0 {
                    return Err(EngineError::validation("pricing", "unit price must be positive"));
                }
                match sub.input(quantity_field) {
                    Some(ProfessionalInput::Number { .. }) => Ok(()),
                    Some(_) => Err(EngineError::validation(
                        "quantity_field",
                        format!("{quantity_field:?} is not a number input"),
                    )),
                    None => Err(EngineError::validation(
                        "quantity_field",
                        format!("no input named {quantity_field:?}"),
                    )),
                }
            }
            _ => Ok(()),
        }
    }
}
