//! Control blocks: `parallel`, `branch` and `loop`.

use super::pipeline::step_name;
use crate::context::ExecutionContext;
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const DEFAULT_LOOP_MAX: i64 = 10;

impl Runtime {
    /// Reserved block properties of a pipeline, in fixed order.
    pub(crate) async fn run_blocks(
        &self,
        holder: &Entity,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<()> {
        match holder.property("parallel") {
            Some(Value::NestedEntity(block)) => {
                self.run_parallel(block, ctx, inherited).await?;
            }
            Some(other) => {
                return Err(RuntimeError::TypeError(format!(
                    "'parallel' must be a block, got {}",
                    other.type_name()
                )))
            }
            None => {}
        }
        match holder.property("branch") {
            Some(Value::Branch { condition, cases }) => {
                self.run_branch(condition, cases, ctx, inherited).await?;
            }
            Some(other) => {
                return Err(RuntimeError::TypeError(format!(
                    "'branch' must be a branch, got {}",
                    other.type_name()
                )))
            }
            None => {}
        }
        match holder.property("loop") {
            Some(Value::Loop {
                max,
                body,
                break_when,
            }) => {
                self.run_loop(*max, body, break_when.as_deref(), ctx, inherited)
                    .await?;
            }
            Some(other) => {
                return Err(RuntimeError::TypeError(format!(
                    "'loop' must be a loop, got {}",
                    other.type_name()
                )))
            }
            None => {}
        }
        Ok(())
    }

    /// Children run concurrently on forked contexts and are all awaited. Forks merge back
    /// in declaration order; the first failure in that order is returned.
    pub(crate) async fn run_parallel(
        &self,
        block: &Entity,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<Value> {
        let children = parallel_children(block);
        debug!(block = %block.name(), children = children.len(), "running parallel block");

        let handles: Vec<_> = children
            .into_iter()
            .map(|(name, child)| {
                let runtime = self.clone();
                let fork = ctx.fork();
                let inherited = inherited.cloned();
                tokio::spawn(async move {
                    let result = runtime
                        .run_named_step(&child, &name, &fork, inherited.as_ref())
                        .await;
                    (name, result, fork)
                })
            })
            .collect();

        let mut outputs = HashMap::new();
        let mut first_error = None;
        for joined in join_all(handles).await {
            match joined {
                Ok((name, result, fork)) => {
                    ctx.merge(fork);
                    match result {
                        Ok(output) => {
                            outputs.insert(name, output);
                        }
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "parallel branch task failed");
                    first_error.get_or_insert(RuntimeError::RequestFailed(format!(
                        "parallel branch aborted: {}",
                        e
                    )));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(Value::Object(outputs)),
        }
    }

    async fn run_branch(
        &self,
        condition: &Value,
        cases: &HashMap<String, Entity>,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<()> {
        let key = Resolver::new(self, ctx).resolve_string(condition).await?;
        match cases.get(&key).or_else(|| cases.get("default")) {
            Some(case) => {
                debug!(case = %key, "branch selected");
                self.run_block_entity(case, ctx, inherited).await
            }
            None => {
                debug!(case = %key, "no branch case matched");
                Ok(())
            }
        }
    }

    async fn run_loop(
        &self,
        max: i64,
        body: &[Entity],
        break_when: Option<&Value>,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<()> {
        let max = if max <= 0 { DEFAULT_LOOP_MAX } else { max };
        if !ctx.has_var("current") {
            if let Some(input) = ctx.get_var("input") {
                ctx.set_var("current", input);
            }
        }
        let resolver = Resolver::new(self, ctx);
        for iteration in 0..max {
            ctx.set_var("iteration", Value::Number(iteration as f64));
            for entity in body {
                self.run_block_entity(entity, ctx, inherited).await?;
            }
            if let Some(condition) = break_when {
                if resolver.resolve(condition).await? == Value::Bool(true) {
                    debug!(iteration, "loop break condition met");
                    break;
                }
            }
        }
        Ok(())
    }

    /// A branch case or loop body entry: a single step, a parallel block, or an entity
    /// whose `step` children run in order.
    async fn run_block_entity(
        &self,
        entity: &Entity,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<()> {
        match entity.kind {
            EntityKind::Parallel => {
                self.run_parallel(entity, ctx, inherited).await?;
            }
            EntityKind::Step if entity.children.is_empty() => {
                self.run_named_step(entity, &step_name(entity, 0), ctx, inherited)
                    .await?;
            }
            _ => {
                for (index, step) in entity.steps().enumerate() {
                    self.run_named_step(step, &step_name(step, index), ctx, inherited)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// `step` children in order, else properties holding nested entities sorted by key.
fn parallel_children(block: &Entity) -> Vec<(String, Entity)> {
    let steps: Vec<(String, Entity)> = block
        .steps()
        .enumerate()
        .map(|(index, step)| (step_name(step, index), step.clone()))
        .collect();
    if !steps.is_empty() {
        return steps;
    }
    let nested: BTreeMap<&String, &Entity> = block
        .properties
        .iter()
        .filter_map(|(key, value)| value.as_entity().map(|entity| (key, entity)))
        .collect();
    nested
        .into_iter()
        .map(|(key, entity)| (key.clone(), entity.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_fall_back_to_sorted_nested_properties() {
        let block = Entity::new(EntityKind::Parallel, "fan")
            .with_property("zeta", Value::entity(Entity::new(EntityKind::Step, "z")))
            .with_property("alpha", Value::entity(Entity::new(EntityKind::Step, "a")))
            .with_property("label", Value::from("ignored"));
        let names: Vec<String> = parallel_children(&block)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn step_children_take_precedence() {
        let block = Entity::new(EntityKind::Parallel, "fan")
            .with_child(Entity::new(EntityKind::Step, "b"))
            .with_child(Entity::new(EntityKind::Step, "a"))
            .with_property("x", Value::entity(Entity::new(EntityKind::Step, "x")));
        let names: Vec<String> = parallel_children(&block)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
