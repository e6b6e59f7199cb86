//! Reorders handlers of a publish by assigned priority.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use switchyard_domain::error::BusError;
use switchyard_domain::id::SubscriptionToken;

use super::{Behavior, InvocationContext, Next};
use crate::registry::HandlerDescriptor;

/// Invokes higher-priority handlers first. Unassigned handlers have priority
/// `0`; equal priorities keep registration order.
#[derive(Debug, Default)]
pub struct PriorityBehavior {
    priorities: RwLock<HashMap<SubscriptionToken, i32>>,
}

impl PriorityBehavior {
    /// No priorities assigned.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `priority` to the subscription `token`.
    pub fn set(&self, token: SubscriptionToken, priority: i32) {
        self.priorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, priority);
    }

    /// Forget the priority of `token`.
    pub fn remove(&self, token: SubscriptionToken) {
        self.priorities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }

    fn priority_of(priorities: &HashMap<SubscriptionToken, i32>, token: SubscriptionToken) -> i32 {
        priorities.get(&token).copied().unwrap_or_default()
    }
}

impl Behavior for PriorityBehavior {
    fn handle<'a>(
        &'a self,
        _ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        next.run()
    }

    fn order(&self, handlers: &mut Vec<Arc<HandlerDescriptor>>) {
        let priorities = self.priorities.read().unwrap_or_else(PoisonError::into_inner);
        if priorities.is_empty() {
            return;
        }
        handlers.sort_by_key(|handler| {
            std::cmp::Reverse(Self::priority_of(&priorities, handler.token()))
        });
    }
}
