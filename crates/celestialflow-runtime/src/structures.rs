//! Graph structure presets.
//!
//! Convenience constructors for the common shapes: linear chains, closed
//! loops, layered cross structures, and complete graphs. Each returns a
//! finalized [`TaskGraph`] ready to start.

use celestialflow_shared::{ConfigurationError, FlowResult, StageMode};

use crate::graph::{LayoutMode, TaskGraph};
use crate::stage::TaskStage;

fn require_stages(count: usize) -> Result<(), ConfigurationError> {
    if count == 0 {
        return Err(ConfigurationError::invalid_option(
            "stages",
            "empty",
            &["at least one stage"],
        ));
    }
    Ok(())
}

/// Linear chain: stage N feeds stage N+1. Stages are named `Stage 1..N`.
pub fn task_chain(stages: Vec<TaskStage>, stage_mode: StageMode) -> FlowResult<TaskGraph> {
    require_stages(stages.len())?;
    let mut graph = TaskGraph::new();
    let handles: Vec<_> = stages.into_iter().map(|s| graph.add_stage(s)).collect();
    for (num, &handle) in handles.iter().enumerate() {
        let next = if num + 1 < handles.len() {
            vec![handles[num + 1]]
        } else {
            Vec::new()
        };
        graph.set_graph_context(handle, &next, stage_mode, &format!("Stage {}", num + 1));
    }
    graph.set_roots(&handles[..1])?;
    Ok(graph)
}

/// Closed ring: A → B → … → A.
///
/// Loops are self-locking: they have no natural completion, so every stage
/// is forced into process mode and the caller must start the graph with
/// termination injection disabled and stop it through the shutdown handle.
pub fn task_loop(stages: Vec<TaskStage>) -> FlowResult<TaskGraph> {
    require_stages(stages.len())?;
    let mut graph = TaskGraph::new();
    let handles: Vec<_> = stages.into_iter().map(|s| graph.add_stage(s)).collect();
    for (num, &handle) in handles.iter().enumerate() {
        let next = if num + 1 < handles.len() {
            vec![handles[num + 1]]
        } else {
            vec![handles[0]]
        };
        graph.set_graph_context(handle, &next, StageMode::Process, &format!("Stage {}", num + 1));
    }
    graph.set_roots(&handles[..1])?;
    Ok(graph)
}

/// Layered structure with full connection between adjacent layers. Stages
/// are named `Layer<i>-<j>`.
pub fn task_cross(layers: Vec<Vec<TaskStage>>, layout_mode: LayoutMode) -> FlowResult<TaskGraph> {
    require_stages(layers.len())?;
    require_stages(layers[0].len())?;
    let mut graph = TaskGraph::with_layout(layout_mode);

    let handle_layers: Vec<Vec<_>> = layers
        .into_iter()
        .map(|layer| layer.into_iter().map(|s| graph.add_stage(s)).collect())
        .collect();

    for (level, layer) in handle_layers.iter().enumerate() {
        let next: Vec<_> = handle_layers
            .get(level + 1)
            .map(|l| l.to_vec())
            .unwrap_or_default();
        for (num, &handle) in layer.iter().enumerate() {
            graph.set_graph_context(
                handle,
                &next,
                StageMode::Process,
                &format!("Layer{}-{}", level + 1, num + 1),
            );
        }
    }
    graph.set_roots(&handle_layers[0])?;
    Ok(graph)
}

/// Complete graph: every stage feeds all others. Like loops, complete
/// graphs never terminate naturally; start without termination injection
/// and stop externally.
pub fn task_complete(stages: Vec<TaskStage>) -> FlowResult<TaskGraph> {
    require_stages(stages.len())?;
    let mut graph = TaskGraph::new();
    let handles: Vec<_> = stages.into_iter().map(|s| graph.add_stage(s)).collect();
    for (num, &handle) in handles.iter().enumerate() {
        let next: Vec<_> = handles
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != num)
            .map(|(_, &h)| h)
            .collect();
        graph.set_graph_context(handle, &next, StageMode::Process, &format!("Node {}", num + 1));
    }
    graph.set_roots(&handles)?;
    Ok(graph)
}
