use std::rc::Rc;

use tracing::{debug, trace};

use crate::{
    fault::ScheduleFault,
    goal::{GoalKey, GoalState},
    pass::{Extension, PassContext, PassOutcome, MAX_PASS_RUNS},
    registry::UnitEntry,
    unit::{Pass, UnitId, UnitKey},
    Scheduler,
};

/// # Driving units through their passes
impl<A> Scheduler<A> {
    /// Attempts to complete every queued unit, plus any units drawn in along the way.
    ///
    /// Returns overall success: the AND of all units' statuses. Pass failures do not stop other
    /// units from being attempted; scheduling faults abort immediately.
    pub fn run_to_completion(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
    ) -> Result<bool, ScheduleFault> {
        self.started = true;
        self.pipelines.lock();

        while let Some(id) = self.worklist.pop_front() {
            if self.registry.unit(id).is_completed() {
                continue;
            }
            trace!(unit = %self.registry.unit(id).key, "popped from worklist");
            self.materialize(id)?;
            let target = self.registry.unit(id).pass_count();
            self.advance_to(ext, id, target)?;
            if self.registry.unit(id).next_pass() >= target {
                self.complete_unit(id);
            } else {
                // Advancing stopped early; requeue so the remaining passes are not lost.
                self.worklist.push_back(id);
            }
        }

        let success = self.registry.all_succeeded();
        debug!(success, "worklist drained");
        Ok(success)
    }

    /// Advances the unit for `key` up to and including its pass for `token`.
    ///
    /// This is the bounded form of the main loop: barriers use it on every other unit, and a
    /// driver uses it to bring a unit up to a known goal before reading its results. Returns the
    /// unit's status afterwards.
    pub fn run_to_goal(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        key: &UnitKey,
        token: &str,
    ) -> Result<bool, ScheduleFault> {
        let id = match self.registry.lookup(key) {
            Some(UnitEntry::Live(id)) => *id,
            Some(UnitEntry::Completed(completed)) => return Ok(completed.success),
            None => {
                return Err(ScheduleFault::PassNotFound {
                    unit: key.to_string(),
                    goal: token.to_owned(),
                })
            }
        };
        self.materialize(id)?;
        let target = self.registry.unit(id).advance_target_for(token).ok_or_else(|| {
            ScheduleFault::PassNotFound {
                unit: key.to_string(),
                goal: token.to_owned(),
            }
        })?;
        self.advance_to(ext, id, target)?;
        Ok(self.registry.unit(id).status())
    }

    /// Builds the unit's pass list from the pipeline registered for its kind. Each pass goal gets
    /// the previous pass goal as a prerequisite; barriers carry no goal of their own.
    fn materialize(&mut self, id: UnitId) -> Result<(), ScheduleFault> {
        if self.registry.unit(id).passes.is_some() {
            return Ok(());
        }
        let kind = Rc::clone(&self.registry.unit(id).kind);
        let key = self.registry.unit(id).key.as_rc();
        let steps = self
            .pipelines
            .get(&kind)
            .ok_or_else(|| ScheduleFault::MissingPipeline(kind.to_string()))?
            .steps()
            .to_vec();

        let mut passes = Vec::with_capacity(steps.len());
        let mut previous = None;
        for step in steps {
            if step.barrier {
                passes.push(Pass {
                    token: step.token,
                    goal: None,
                    barrier: true,
                });
                continue;
            }
            let goal = self
                .goals
                .intern(GoalKey::of(Rc::clone(&step.token), Rc::clone(&key)));
            if let Some(previous) = previous {
                self.goals.add_prerequisite(goal, previous)?;
            }
            previous = Some(goal);
            passes.push(Pass {
                token: step.token,
                goal: Some(goal),
                barrier: false,
            });
        }
        self.registry.unit_mut(id).passes = Some(passes);
        Ok(())
    }

    /// Runs the unit's passes in order until its cursor reaches `target`.
    ///
    /// The cursor advances on success and on failure alike; it only stays put while a missing
    /// dependency is being resolved. Once a unit has failed, its remaining passes are skipped
    /// (their goals become unreachable) so the unit still drains and frees its memory.
    fn advance_to(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        id: UnitId,
        target: usize,
    ) -> Result<(), ScheduleFault> {
        self.materialize(id)?;
        let target = target.min(self.registry.unit(id).pass_count());

        while self.registry.unit(id).next_pass() < target {
            if self.running.contains(&id) {
                // Someone is asking a unit to advance past the pass it is currently executing.
                // The pipeline requires this unit's later state to produce its earlier state.
                return Err(ScheduleFault::CyclicScheduling(format!(
                    "unit `{}` was asked to advance while one of its passes is still running",
                    self.registry.unit(id).key,
                )));
            }
            let index = self.registry.unit(id).next_pass();
            let pass = self.registry.unit(id).pass(index).clone();

            let ok = if !self.registry.unit(id).status() {
                trace!(
                    unit = %self.registry.unit(id).key,
                    pass = %pass.name(),
                    "skipping pass of failed unit"
                );
                if let Some(goal) = pass.goal {
                    self.goals.mark(goal, GoalState::Unreachable);
                }
                false
            } else if pass.barrier {
                self.run_barrier(ext, id, &pass.token)?
            } else {
                self.run_one_pass(ext, id, index)?
            };

            let unit = self.registry.unit_mut(id);
            if !ok && unit.status {
                unit.status = false;
                unit.failed_pass = Some(Rc::from(pass.name()));
            }
            unit.next_pass = index + 1;
        }
        Ok(())
    }

    /// Runs a barrier owned by `owner`: every other live unit with a pass for `token` is advanced
    /// up to that pass. Visitation is best-effort - a failed unit does not stop the rest from
    /// being brought up - but the result is the AND of all visited units' statuses.
    fn run_barrier(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        owner: UnitId,
        token: &Rc<str>,
    ) -> Result<bool, ScheduleFault> {
        debug!(unit = %self.registry.unit(owner).key, barrier = %token, "running barrier");
        self.running.push(owner);
        let result = self.visit_barrier(ext, owner, token);
        self.running.pop();
        result
    }

    fn visit_barrier(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        owner: UnitId,
        token: &Rc<str>,
    ) -> Result<bool, ScheduleFault> {
        let mut ok = true;
        for id in self.registry.live_units() {
            if id == owner {
                continue;
            }
            self.materialize(id)?;
            let Some(target) = self.registry.unit(id).advance_target_for(token) else {
                // This unit's pipeline has no pass for the goal; it is not subject to the barrier.
                continue;
            };
            self.advance_to(ext, id, target)?;
            ok &= self.registry.unit(id).status();
        }
        Ok(ok)
    }

    /// Runs one executable pass, resolving missing-dependency signals until the pass completes
    /// with a result. The retry loop is bounded; a pass that cannot stop asking is a scheduling
    /// fault, not an infinite loop.
    fn run_one_pass(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        id: UnitId,
        index: usize,
    ) -> Result<bool, ScheduleFault> {
        let (goal_id, token, unit_key) = {
            let unit = self.registry.unit(id);
            let pass = unit.pass(index);
            (
                pass.goal.expect("barriers are not run as ordinary passes"),
                Rc::clone(&pass.token),
                unit.key.clone(),
            )
        };
        let goal_key = self.goals.key(goal_id).clone();

        loop {
            let runs = self.run_counts.entry((id, index)).or_insert(0);
            *runs += 1;
            if *runs > MAX_PASS_RUNS {
                return Err(ScheduleFault::CyclicScheduling(format!(
                    "pass `{token}` of unit `{unit_key}` was attempted {MAX_PASS_RUNS} times \
                     without completing",
                )));
            }

            self.goals.mark(goal_id, GoalState::Running);
            trace!(unit = %unit_key, pass = %token, "running pass");

            let mut ast = self
                .registry
                .unit_mut(id)
                .ast
                .take()
                .expect("live units own their AST between passes");
            self.running.push(id);
            let outcome = {
                let denied = self.denied.entry(id).or_default();
                let mut cx = PassContext {
                    registry: &mut self.registry,
                    pipelines: &self.pipelines,
                    diagnostics: &mut self.diagnostics,
                    denied: &*denied,
                    current: id,
                    current_key: unit_key.clone(),
                };
                ext.execute_pass(&goal_key, &mut ast, &mut cx)
            };
            self.running.pop();
            self.registry.unit_mut(id).ast = Some(ast);

            match outcome {
                PassOutcome::Success => {
                    trace!(unit = %unit_key, pass = %token, "pass succeeded");
                    self.goals.mark(goal_id, GoalState::Reached);
                    return Ok(true);
                }
                PassOutcome::Failure => {
                    debug!(unit = %unit_key, pass = %token, "pass failed");
                    self.goals.mark(goal_id, GoalState::Unreachable);
                    return Ok(false);
                }
                PassOutcome::NeedsGoal { goal, mandatory } => {
                    debug!(
                        unit = %unit_key,
                        pass = %token,
                        needed = %goal,
                        mandatory,
                        "pass needs another goal"
                    );
                    let satisfied = self.resolve_dependency(ext, id, &goal)?;
                    if !satisfied {
                        debug!(needed = %goal, "dependency cannot be satisfied; denying");
                        self.denied.entry(id).or_default().insert(goal);
                    }
                }
            }
        }
    }

    /// Satisfies a goal signaled by a pass of `requester`: finds or loads the owning unit and
    /// advances it through its pass for the goal. Returns whether the goal was reached.
    ///
    /// Resolutions in flight are tracked per `(unit, goal)` pair; hitting the same pair again
    /// means the dependency cannot make progress without the requester making progress first,
    /// which is a true cycle.
    fn resolve_dependency(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        requester: UnitId,
        goal: &GoalKey,
    ) -> Result<bool, ScheduleFault> {
        if let Some(id) = self.goals.get(goal) {
            if self.goals.state(id) == GoalState::Reached {
                return Ok(true);
            }
        }

        let in_flight = (requester, goal.clone());
        if !self.resolving.insert(in_flight.clone()) {
            return Err(ScheduleFault::CyclicScheduling(format!(
                "goal `{goal}` needed by unit `{}` depends on that unit making progress first",
                self.registry.unit(requester).key,
            )));
        }
        let result = self.resolve_dependency_inner(ext, goal);
        self.resolving.remove(&in_flight);
        result
    }

    fn resolve_dependency_inner(
        &mut self,
        ext: &mut dyn Extension<Ast = A>,
        goal: &GoalKey,
    ) -> Result<bool, ScheduleFault> {
        let Some((key, kind)) = ext.locate_goal(goal) else {
            debug!(%goal, "extension cannot locate a unit for goal");
            return Ok(false);
        };

        let target = match self.registry.lookup(&key) {
            Some(UnitEntry::Live(id)) => *id,
            Some(UnitEntry::Completed(_)) => {
                // The owning unit already finished; whatever state its pass for this goal ended
                // in is all we will ever get.
                let pass_goal = GoalKey::of(Rc::clone(&goal.kind), key.as_rc());
                let reached = self
                    .goals
                    .get(&pass_goal)
                    .map_or(false, |id| self.goals.state(id) == GoalState::Reached);
                if reached {
                    self.mark_alias_reached(goal);
                }
                return Ok(reached);
            }
            None => {
                let Some(ast) = ext.load_unit(&key, &kind) else {
                    debug!(unit = %key, "source for dependency unit cannot be loaded");
                    return Ok(false);
                };
                let parent = self.running.last().copied();
                let (id, created) = self.registry.get_or_create(key.clone(), kind, ast, parent)?;
                if created && parent.is_none() {
                    trace!(unit = %key, "dependency loaded as new root unit");
                    self.worklist.push_back(id);
                }
                id
            }
        };

        self.materialize(target)?;
        let Some(to) = self.registry.unit(target).advance_target_for(&goal.kind) else {
            return Err(ScheduleFault::PassNotFound {
                unit: key.to_string(),
                goal: goal.to_string(),
            });
        };
        self.advance_to(ext, target, to)?;

        let pass_goal = self
            .registry
            .unit(target)
            .pass(to - 1)
            .goal
            .expect("dependency target pass cannot be a barrier");
        let reached = self.goals.state(pass_goal) == GoalState::Reached;
        if reached {
            self.mark_alias_reached(goal);
        }
        Ok(reached)
    }

    /// The goal a pass asks for may name its subject differently than the owning unit's own pass
    /// goal (a class name rather than a unit key); once satisfied, the requested spelling is
    /// marked reached as well so later requests short-circuit.
    fn mark_alias_reached(&mut self, goal: &GoalKey) {
        let id = self.goals.intern(goal.clone());
        self.goals.mark(id, GoalState::Reached);
    }

    /// Completes a unit: substitutes the registry sentinel, frees its AST and pass list, and
    /// rescues its children. Each child is rebound to the completed unit's parent; children of a
    /// completed root are themselves roots now and the unfinished ones are queued.
    fn complete_unit(&mut self, id: UnitId) {
        let parent = self.registry.unit(id).parent();
        let key = self.registry.unit(id).key.clone();
        let success = self.registry.unit(id).status();
        let children = self.registry.complete(id);
        debug!(unit = %key, success, "unit completed");

        for child in children {
            self.registry.unit_mut(child).parent = parent;
            match parent {
                Some(parent) => self.registry.unit_mut(parent).children.push(child),
                None => {
                    if !self.registry.unit(child).is_completed() {
                        trace!(
                            child = %self.registry.unit(child).key,
                            "orphaned child promoted to root"
                        );
                        self.worklist.push_back(child);
                    }
                }
            }
        }
    }
}
