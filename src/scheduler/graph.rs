//! 派发依赖图
//!
//! 使用邻接表和入度表实现 Kahn 拓扑排序，按「波次」而不是扁平顺序输出：
//! 每一波恰好包含依赖已被之前各波全部满足的 Agent。

use std::collections::HashMap;

use crate::scheduler::types::{AgentId, DispatchSpec, SchedulerError};

/// 派发依赖图
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// 邻接表：Agent -> 依赖它的 Agent 列表
    pub adjacency: HashMap<AgentId, Vec<AgentId>>,
    /// 入度表：Agent -> 未满足的依赖数
    pub in_degree: HashMap<AgentId, usize>,
}

impl DependencyGraph {
    /// 建图；依赖引用了批外的 Agent 时报 UnknownDependency
    pub fn new(dispatches: &HashMap<AgentId, DispatchSpec>) -> Result<Self, SchedulerError> {
        let mut adjacency: HashMap<AgentId, Vec<AgentId>> = HashMap::new();
        let mut in_degree: HashMap<AgentId, usize> = HashMap::new();

        for agent_id in dispatches.keys() {
            in_degree.insert(agent_id.clone(), 0);
            adjacency.insert(agent_id.clone(), Vec::new());
        }

        // 按 id 排序遍历，保证多个未知依赖时报错稳定
        let mut ids: Vec<&AgentId> = dispatches.keys().collect();
        ids.sort();

        for agent_id in ids {
            for dep_id in &dispatches[agent_id].depends_on {
                if !dispatches.contains_key(dep_id) {
                    return Err(SchedulerError::UnknownDependency(dep_id.clone()));
                }
                adjacency.entry(dep_id.clone()).or_default().push(agent_id.clone());
                *in_degree.entry(agent_id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self { adjacency, in_degree })
    }

    /// 逐波剥离入度为 0 的节点；剩余节点全部有未满足依赖时即存在环
    pub fn waves(&self) -> Result<Vec<Vec<AgentId>>, SchedulerError> {
        let mut in_degree = self.in_degree.clone();
        let mut waves = Vec::new();

        while !in_degree.is_empty() {
            let mut wave: Vec<AgentId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(agent_id, _)| agent_id.clone())
                .collect();

            if wave.is_empty() {
                return Err(SchedulerError::CycleDetected);
            }
            wave.sort();

            for agent_id in &wave {
                in_degree.remove(agent_id);
                if let Some(dependents) = self.adjacency.get(agent_id) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree -= 1;
                        }
                    }
                }
            }

            waves.push(wave);
        }

        Ok(waves)
    }
}

/// 规划执行波次；空输入返回空列表
pub fn plan_waves(
    dispatches: &HashMap<AgentId, DispatchSpec>,
) -> Result<Vec<Vec<AgentId>>, SchedulerError> {
    DependencyGraph::new(dispatches)?.waves()
}
