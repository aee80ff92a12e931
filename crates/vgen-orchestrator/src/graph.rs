//! Job graph: the per-run DAG of generation tasks.
//!
//! Readiness is tracked with per-task counters of unmet dependencies. A
//! success decrements the counters of its dependents and queues any that
//! reach zero; `ready_tasks` drains that queue, so no event rescans the
//! whole graph.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use vgen_models::{
    ArtifactRef, PipelineRun, SceneSpec, Task, TaskError, TaskId, TaskKind, TaskState,
};

use crate::error::{GraphError, GraphResult};

/// Result of one task attempt, as recorded on the graph.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded(ArtifactRef),
    /// Permanent failure (non-retryable, or retries exhausted)
    Failed(TaskError),
}

/// Per-state task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub blocked: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone)]
pub struct JobGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    dependents: Vec<Vec<usize>>,
    /// Dependencies not yet Succeeded
    pending: Vec<usize>,
    depth: Vec<u32>,
    /// Blocked tasks whose dependencies have all succeeded
    promotable: VecDeque<usize>,
}

impl JobGraph {
    /// Graph for a run, with an outline root when the request asks for one.
    pub fn for_run(run: &PipelineRun) -> GraphResult<Self> {
        Self::assemble(&run.scenes, run.request.outline)
    }

    /// Build the four tasks of every scene.
    ///
    /// Per scene: Script (no dependencies), Image (Script), Clip (Image and
    /// Script), Voice (Script). Tasks are laid out by scene index, then kind,
    /// so the same scenes always yield the same graph.
    pub fn build(scenes: &[SceneSpec]) -> GraphResult<Self> {
        Self::assemble(scenes, false)
    }

    /// Like [`JobGraph::build`], plus one Outline task that every Script
    /// depends on. The outline comes first in graph order.
    pub fn build_with_outline(scenes: &[SceneSpec]) -> GraphResult<Self> {
        Self::assemble(scenes, true)
    }

    fn assemble(scenes: &[SceneSpec], outline: bool) -> GraphResult<Self> {
        if scenes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut indices: Vec<u32> = scenes.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        for pair in indices.windows(2) {
            if pair[0] == pair[1] {
                return Err(GraphError::DuplicateScene(pair[0]));
            }
        }

        let mut tasks = Vec::with_capacity(indices.len() * TaskKind::SCENE.len() + 1);
        if outline {
            // indices is sorted and non-empty
            tasks.push(Task::outline(indices[0]));
        }
        for &scene_index in &indices {
            for kind in TaskKind::SCENE {
                let mut deps: Vec<TaskId> = kind
                    .upstream()
                    .iter()
                    .map(|up| TaskId::for_scene(scene_index, *up))
                    .collect();
                if outline && kind == TaskKind::Script {
                    deps.push(TaskId::outline());
                }
                tasks.push(Task::new(scene_index, kind, deps));
            }
        }

        Self::from_tasks(tasks)
    }

    /// Validate an arbitrary task set and index it.
    ///
    /// Rejects duplicate ids, dangling references, dependencies on a later
    /// scene and cycles.
    pub(crate) fn from_tasks(tasks: Vec<Task>) -> GraphResult<Self> {
        if tasks.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); tasks.len()];
        let mut in_degree = vec![0usize; tasks.len()];
        let mut pending = vec![0usize; tasks.len()];

        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let &d = index.get(dep).ok_or_else(|| GraphError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                if tasks[d].scene_index > task.scene_index {
                    return Err(GraphError::ForwardSceneDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents[d].push(i);
                in_degree[i] += 1;
                if tasks[d].state != TaskState::Succeeded {
                    pending[i] += 1;
                }
            }
        }

        // Kahn's algorithm; also yields each task's topological depth.
        let mut depth = vec![0u32; tasks.len()];
        let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &j in &dependents[i] {
                depth[j] = depth[j].max(depth[i] + 1);
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
        if visited < tasks.len() {
            let mut cyclic: Vec<TaskId> = (0..tasks.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| tasks[i].id.clone())
                .collect();
            cyclic.sort();
            return Err(GraphError::Cycle(cyclic));
        }

        let promotable = (0..tasks.len())
            .filter(|&i| tasks[i].state == TaskState::Blocked && pending[i] == 0)
            .collect();

        Ok(Self {
            tasks,
            index,
            dependents,
            pending,
            depth,
            promotable,
        })
    }

    /// Move every Blocked task whose dependencies have all succeeded to
    /// Ready, and return their ids.
    pub fn ready_tasks(&mut self) -> Vec<TaskId> {
        let mut ready = Vec::with_capacity(self.promotable.len());
        while let Some(i) = self.promotable.pop_front() {
            let task = &mut self.tasks[i];
            if task.state == TaskState::Blocked {
                task.state = TaskState::Ready;
                task.updated_at = Utc::now();
                ready.push(task.id.clone());
            }
        }
        ready
    }

    /// Ready → InFlight. Returns the new attempt number.
    pub fn mark_dispatched(&mut self, id: &TaskId) -> GraphResult<u32> {
        let task = self.task_in_state_mut(id, TaskState::Ready, TaskState::InFlight)?;
        task.state = TaskState::InFlight;
        task.attempts += 1;
        task.updated_at = Utc::now();
        Ok(task.attempts)
    }

    /// InFlight → Ready after a retryable failure. The next dispatch is a new
    /// attempt on the same task.
    pub fn mark_retrying(&mut self, id: &TaskId, error: TaskError) -> GraphResult<()> {
        let task = self.task_in_state_mut(id, TaskState::InFlight, TaskState::Ready)?;
        task.state = TaskState::Ready;
        task.last_error = Some(error);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Record the terminal outcome of an in-flight task.
    ///
    /// Success releases dependents. Failure abandons every task transitively
    /// downstream; their ids are returned in breadth-first order.
    pub fn mark(&mut self, id: &TaskId, outcome: TaskOutcome) -> GraphResult<Vec<TaskId>> {
        let to = match outcome {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
        };
        let i = self.position(id)?;
        if self.tasks[i].state != TaskState::InFlight {
            return Err(GraphError::invalid_transition(id, self.tasks[i].state, to));
        }

        let now = Utc::now();
        match outcome {
            TaskOutcome::Succeeded(artifact) => {
                let task = &mut self.tasks[i];
                task.state = TaskState::Succeeded;
                task.artifact = Some(artifact);
                task.updated_at = now;

                for k in 0..self.dependents[i].len() {
                    let j = self.dependents[i][k];
                    self.pending[j] = self.pending[j].saturating_sub(1);
                    if self.pending[j] == 0 && self.tasks[j].state == TaskState::Blocked {
                        self.promotable.push_back(j);
                    }
                }
                Ok(Vec::new())
            }
            TaskOutcome::Failed(error) => {
                let task = &mut self.tasks[i];
                task.state = TaskState::Failed;
                task.last_error = Some(error);
                task.updated_at = now;
                Ok(self.abandon_downstream(i))
            }
        }
    }

    /// Abandon a single non-terminal, not in-flight task. Used when
    /// replaying a journal.
    pub(crate) fn abandon(&mut self, id: &TaskId, upstream: &TaskId) -> GraphResult<()> {
        let i = self.position(id)?;
        let task = &mut self.tasks[i];
        match task.state {
            TaskState::Abandoned => Ok(()),
            TaskState::Blocked | TaskState::Ready => {
                task.state = TaskState::Abandoned;
                task.last_error = Some(TaskError::upstream(upstream));
                task.updated_at = Utc::now();
                Ok(())
            }
            from => Err(GraphError::invalid_transition(id, from, TaskState::Abandoned)),
        }
    }

    fn abandon_downstream(&mut self, root: usize) -> Vec<TaskId> {
        let root_id = self.tasks[root].id.clone();
        let mut abandoned = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.dependents[root].iter().copied().collect();

        while let Some(j) = queue.pop_front() {
            if !seen.insert(j) {
                continue;
            }
            let task = &mut self.tasks[j];
            if matches!(task.state, TaskState::Blocked | TaskState::Ready) {
                task.state = TaskState::Abandoned;
                task.last_error = Some(TaskError::upstream(&root_id));
                task.updated_at = Utc::now();
                abandoned.push(task.id.clone());
            }
            queue.extend(self.dependents[j].iter().copied());
        }
        abandoned
    }

    /// Put a task interrupted mid-attempt back to Ready.
    ///
    /// The interrupted attempt never reported, so it is rolled back and the
    /// same attempt number is dispatched again.
    pub fn requeue_interrupted(&mut self, id: &TaskId) -> GraphResult<()> {
        let task = self.task_in_state_mut(id, TaskState::InFlight, TaskState::Ready)?;
        task.state = TaskState::Ready;
        task.attempts = task.attempts.saturating_sub(1);
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Requeue every in-flight task. Returns the requeued ids.
    pub fn requeue_in_flight(&mut self) -> Vec<TaskId> {
        let in_flight: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::InFlight)
            .map(|t| t.id.clone())
            .collect();
        for id in &in_flight {
            // State was checked above
            let _ = self.requeue_interrupted(id);
        }
        in_flight
    }

    /// All Ready tasks, in graph order.
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| t.id.clone())
            .collect()
    }

    /// No task is Blocked, Ready or InFlight.
    pub fn is_drained(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn scene_task(&self, scene_index: u32, kind: TaskKind) -> Option<&Task> {
        self.task(&TaskId::for_scene(scene_index, kind))
    }

    pub fn outline_task(&self) -> Option<&Task> {
        self.task(&TaskId::outline())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Scene indices, ascending.
    pub fn scene_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.tasks.iter().map(|t| t.scene_index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Topological depth (0 for tasks without dependencies).
    pub fn depth(&self, id: &TaskId) -> Option<u32> {
        self.index.get(id).map(|&i| self.depth[i])
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in &self.tasks {
            match task.state {
                TaskState::Blocked => counts.blocked += 1,
                TaskState::Ready => counts.ready += 1,
                TaskState::InFlight => counts.in_flight += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Abandoned => counts.abandoned += 1,
            }
        }
        counts
    }

    fn position(&self, id: &TaskId) -> GraphResult<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(id.clone()))
    }

    fn task_in_state_mut(
        &mut self,
        id: &TaskId,
        expected: TaskState,
        to: TaskState,
    ) -> GraphResult<&mut Task> {
        let i = self.position(id)?;
        let task = &mut self.tasks[i];
        if task.state != expected {
            return Err(GraphError::invalid_transition(id, task.state, to));
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgen_models::ContentKind;

    fn scenes(n: u32) -> Vec<SceneSpec> {
        (0..n)
            .map(|i| SceneSpec::new(i, format!("scene {}", i), 5.0))
            .collect()
    }

    fn artifact(id: &TaskId) -> ArtifactRef {
        ArtifactRef::new(Some(id.clone()), format!("k/{}", id), ContentKind::Script, 1)
    }

    fn succeed(graph: &mut JobGraph, id: &TaskId) {
        graph.mark_dispatched(id).unwrap();
        graph.mark(id, TaskOutcome::Succeeded(artifact(id))).unwrap();
    }

    fn id(scene: u32, kind: TaskKind) -> TaskId {
        TaskId::for_scene(scene, kind)
    }

    #[test]
    fn test_build_has_four_tasks_per_scene() {
        for n in 1..6 {
            let graph = JobGraph::build(&scenes(n)).unwrap();
            assert_eq!(graph.len(), 4 * n as usize);
            assert_eq!(graph.scene_indices(), (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_scene_indices_sparse_and_unordered() {
        let scenes = vec![
            SceneSpec::new(9, "c", 4.0),
            SceneSpec::new(2, "a", 4.0),
            SceneSpec::new(5, "b", 4.0),
        ];
        let graph = JobGraph::build_with_outline(&scenes).unwrap();
        assert_eq!(graph.scene_indices(), vec![2, 5, 9]);
        assert_eq!(graph.outline_task().unwrap().scene_index, 2);
    }

    #[test]
    fn test_outline_gates_every_script() {
        let mut graph = JobGraph::build_with_outline(&scenes(3)).unwrap();
        assert_eq!(graph.len(), 13);
        let outline = TaskId::outline();
        assert_eq!(graph.tasks()[0].id, outline);

        for scene in 0..3 {
            let script = graph.scene_task(scene, TaskKind::Script).unwrap();
            assert_eq!(script.dependencies, vec![outline.clone()]);
        }
        assert_eq!(graph.depth(&id(0, TaskKind::Clip)), Some(3));

        assert_eq!(graph.ready_tasks(), vec![outline.clone()]);
        succeed(&mut graph, &outline);
        assert_eq!(
            graph.ready_tasks(),
            (0..3).map(|s| id(s, TaskKind::Script)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_outline_failure_abandons_all_scenes() {
        let mut graph = JobGraph::build_with_outline(&scenes(2)).unwrap();
        graph.ready_tasks();
        let outline = TaskId::outline();
        graph.mark_dispatched(&outline).unwrap();
        let abandoned = graph
            .mark(&outline, TaskOutcome::Failed(TaskError::permanent("refused")))
            .unwrap();

        assert_eq!(abandoned.len(), 8);
        assert!(graph.is_drained());
        assert_eq!(graph.counts().abandoned, 8);
    }

    #[test]
    fn test_build_dependency_edges() {
        let graph = JobGraph::build(&scenes(2)).unwrap();

        for scene in 0..2 {
            let script = graph.scene_task(scene, TaskKind::Script).unwrap();
            assert!(script.dependencies.is_empty());

            let image = graph.scene_task(scene, TaskKind::Image).unwrap();
            assert_eq!(image.dependencies, vec![id(scene, TaskKind::Script)]);

            let clip = graph.scene_task(scene, TaskKind::Clip).unwrap();
            assert_eq!(
                clip.dependencies,
                vec![id(scene, TaskKind::Image), id(scene, TaskKind::Script)]
            );

            let voice = graph.scene_task(scene, TaskKind::Voice).unwrap();
            assert_eq!(voice.dependencies, vec![id(scene, TaskKind::Script)]);
        }
    }

    #[test]
    fn test_dependencies_have_lower_depth() {
        let graph = JobGraph::build(&scenes(3)).unwrap();
        for task in graph.tasks() {
            let depth = graph.depth(&task.id).unwrap();
            for dep in &task.dependencies {
                assert!(graph.depth(dep).unwrap() < depth);
            }
        }
        assert_eq!(graph.depth(&id(0, TaskKind::Clip)), Some(2));
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut shuffled = scenes(4);
        shuffled.reverse();
        let a = JobGraph::build(&scenes(4)).unwrap();
        let b = JobGraph::build(&shuffled).unwrap();

        let ids_a: Vec<_> = a.tasks().iter().map(|t| (&t.id, &t.dependencies)).collect();
        let ids_b: Vec<_> = b.tasks().iter().map(|t| (&t.id, &t.dependencies)).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_build_rejects_empty_and_duplicates() {
        assert_eq!(JobGraph::build(&[]).unwrap_err(), GraphError::EmptyGraph);

        let mut dup = scenes(2);
        dup.push(SceneSpec::new(1, "again", 3.0));
        assert_eq!(
            JobGraph::build(&dup).unwrap_err(),
            GraphError::DuplicateScene(1)
        );
    }

    #[test]
    fn test_from_tasks_rejects_dangling_reference() {
        let task = Task::new(0, TaskKind::Image, vec![id(0, TaskKind::Script)]);
        assert!(matches!(
            JobGraph::from_tasks(vec![task]),
            Err(GraphError::DanglingDependency { .. })
        ));
    }

    #[test]
    fn test_from_tasks_rejects_forward_scene_dependency() {
        let later = Task::new(3, TaskKind::Script, vec![]);
        let early = Task::new(1, TaskKind::Image, vec![id(3, TaskKind::Script)]);
        assert!(matches!(
            JobGraph::from_tasks(vec![later, early]),
            Err(GraphError::ForwardSceneDependency { .. })
        ));
    }

    #[test]
    fn test_from_tasks_rejects_cycle() {
        let a = Task::new(0, TaskKind::Script, vec![id(0, TaskKind::Voice)]);
        let b = Task::new(0, TaskKind::Voice, vec![id(0, TaskKind::Script)]);
        let err = JobGraph::from_tasks(vec![a, b]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec![id(0, TaskKind::Script), id(0, TaskKind::Voice)])
        );
    }

    #[test]
    fn test_readiness_follows_dependencies() {
        let mut graph = JobGraph::build(&scenes(2)).unwrap();

        let ready = graph.ready_tasks();
        assert_eq!(
            ready,
            vec![id(0, TaskKind::Script), id(1, TaskKind::Script)]
        );
        assert!(graph.ready_tasks().is_empty());

        succeed(&mut graph, &id(0, TaskKind::Script));
        assert_eq!(
            graph.ready_tasks(),
            vec![id(0, TaskKind::Image), id(0, TaskKind::Voice)]
        );

        succeed(&mut graph, &id(0, TaskKind::Image));
        assert_eq!(graph.ready_tasks(), vec![id(0, TaskKind::Clip)]);
        assert_eq!(
            graph.scene_task(1, TaskKind::Image).unwrap().state,
            TaskState::Blocked
        );
    }

    #[test]
    fn test_script_failure_abandons_scene() {
        let mut graph = JobGraph::build(&scenes(2)).unwrap();
        graph.ready_tasks();

        let script = id(0, TaskKind::Script);
        graph.mark_dispatched(&script).unwrap();
        let abandoned = graph
            .mark(&script, TaskOutcome::Failed(TaskError::permanent("rejected")))
            .unwrap();

        assert_eq!(abandoned.len(), 3);
        for kind in [TaskKind::Image, TaskKind::Clip, TaskKind::Voice] {
            let task = graph.scene_task(0, kind).unwrap();
            assert_eq!(task.state, TaskState::Abandoned);
            assert_eq!(task.last_error, Some(TaskError::upstream(&script)));
        }
        assert!(graph.ready_tasks().is_empty());
        assert_eq!(
            graph.scene_task(1, TaskKind::Script).unwrap().state,
            TaskState::Ready
        );
    }

    #[test]
    fn test_image_failure_leaves_voice_runnable() {
        let mut graph = JobGraph::build(&scenes(1)).unwrap();
        graph.ready_tasks();
        succeed(&mut graph, &id(0, TaskKind::Script));
        graph.ready_tasks();

        let image = id(0, TaskKind::Image);
        graph.mark_dispatched(&image).unwrap();
        let abandoned = graph
            .mark(&image, TaskOutcome::Failed(TaskError::permanent("policy")))
            .unwrap();

        assert_eq!(abandoned, vec![id(0, TaskKind::Clip)]);
        assert_eq!(
            graph.scene_task(0, TaskKind::Voice).unwrap().state,
            TaskState::Ready
        );
        assert!(!graph.is_drained());

        succeed(&mut graph, &id(0, TaskKind::Voice));
        assert!(graph.is_drained());
        let counts = graph.counts();
        assert_eq!((counts.succeeded, counts.failed, counts.abandoned), (2, 1, 1));
    }

    #[test]
    fn test_retry_counts_attempts_on_same_task() {
        let mut graph = JobGraph::build(&scenes(1)).unwrap();
        graph.ready_tasks();
        let script = id(0, TaskKind::Script);

        assert_eq!(graph.mark_dispatched(&script).unwrap(), 1);
        graph
            .mark_retrying(&script, TaskError::transient("503"))
            .unwrap();
        assert_eq!(graph.mark_dispatched(&script).unwrap(), 2);
        assert_eq!(graph.task(&script).unwrap().attempts, 2);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut graph = JobGraph::build(&scenes(1)).unwrap();
        let clip = id(0, TaskKind::Clip);

        // Blocked task cannot be dispatched
        assert!(matches!(
            graph.mark_dispatched(&clip),
            Err(GraphError::InvalidTransition { .. })
        ));

        graph.ready_tasks();
        let script = id(0, TaskKind::Script);
        succeed(&mut graph, &script);

        // No resurrection from a terminal state
        assert!(graph.mark_dispatched(&script).is_err());
        assert!(graph
            .mark(&script, TaskOutcome::Failed(TaskError::permanent("late")))
            .is_err());
        assert!(matches!(
            graph.mark_dispatched(&TaskId::from_string("nope")),
            Err(GraphError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_requeue_in_flight_rolls_back_attempt() {
        let mut graph = JobGraph::build(&scenes(1)).unwrap();
        graph.ready_tasks();
        let script = id(0, TaskKind::Script);
        graph.mark_dispatched(&script).unwrap();

        assert_eq!(graph.requeue_in_flight(), vec![script.clone()]);
        let task = graph.task(&script).unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.attempts, 0);
        assert_eq!(graph.ready_ids(), vec![script]);
    }
}
