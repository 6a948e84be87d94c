//! Offers from one host and the tasks chosen to run on them.

use anyhow::{bail, Result};
use lattice_id::OfferId;
use lattice_protocol::{Offer, ResourceTotals, TaskInfo};
use tracing::{debug, info};

use crate::transport::SchedulerClient;

/// One host's offers for a single matching round.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferHolder {
    offers: Vec<Offer>,
    accepted_tasks: Vec<TaskInfo>,
}

impl OfferHolder {
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            offers,
            accepted_tasks: Vec::new(),
        }
    }

    pub fn with_tasks(offers: Vec<Offer>, tasks: Vec<TaskInfo>) -> Self {
        Self {
            offers,
            accepted_tasks: tasks,
        }
    }

    pub fn add_task(&mut self, task: TaskInfo) {
        self.accepted_tasks.push(task);
    }

    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    pub fn into_offers(self) -> Vec<Offer> {
        self.offers
    }

    pub fn accepted_tasks(&self) -> &[TaskInfo] {
        &self.accepted_tasks
    }

    pub fn has_accepted_tasks(&self) -> bool {
        !self.accepted_tasks.is_empty()
    }

    pub fn offer_ids(&self) -> Vec<OfferId> {
        self.offers.iter().map(|o| o.id.clone()).collect()
    }

    /// Hostname of the first offer.
    pub fn hostname(&self) -> Option<&str> {
        self.offers.first().map(|o| o.hostname.as_str())
    }

    /// Launches the accepted tasks and returns the offers they did not need.
    ///
    /// Task resources are drawn from the offers in order. Only offers that
    /// contributed resources are accepted.
    pub async fn launch_tasks_and_get_unused_offers(
        &self,
        client: &dyn SchedulerClient,
    ) -> Result<Vec<Offer>> {
        let mut available: Vec<ResourceTotals> = self.offers.iter().map(Offer::totals).collect();
        let mut used = vec![false; self.offers.len()];

        for task in &self.accepted_tasks {
            let mut unmet = task.totals();
            for (index, totals) in available.iter_mut().enumerate() {
                if unmet.is_zero() {
                    break;
                }
                let before = unmet;
                unmet = totals.consume(&before);
                if unmet != before {
                    used[index] = true;
                }
            }
            if !unmet.is_zero() {
                bail!(
                    "task {} does not fit in the offers from {}",
                    task.task_id,
                    self.hostname().unwrap_or("unknown host")
                );
            }
        }

        // Zero-resource tasks still need an offer to launch against.
        if !self.accepted_tasks.is_empty() && !used.contains(&true) {
            if let Some(first) = used.first_mut() {
                *first = true;
            }
        }

        let accepted_ids: Vec<OfferId> = self
            .offers
            .iter()
            .zip(&used)
            .filter(|(_, used)| **used)
            .map(|(offer, _)| offer.id.clone())
            .collect();

        if accepted_ids.is_empty() {
            bail!("no offers to launch {} tasks against", self.accepted_tasks.len());
        }

        info!(
            host = self.hostname().unwrap_or(""),
            tasks = self.accepted_tasks.len(),
            offers = accepted_ids.len(),
            "Launching tasks"
        );
        client
            .accept(accepted_ids, self.accepted_tasks.clone())
            .await?;

        let unused: Vec<Offer> = self
            .offers
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(offer, _)| offer.clone())
            .collect();
        debug!(unused = unused.len(), "Offers left over after launch");
        Ok(unused)
    }
}
