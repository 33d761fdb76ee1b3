//! Dependency graph between the resources of a [Stack].

use crate::{intrinsic, Error, LogicalId, Stack};
use std::collections::{BTreeMap, HashSet};

/// Why one resource must be created after another.
///
/// `Explicit` ranks above `Reference`: when both apply, the edge is explicit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Edge {
    /// The dependent's properties refer to the dependency (`Ref`, `Fn::GetAtt`).
    Reference,
    /// The dependent declares the dependency in `DependsOn`.
    Explicit,
}

/// Directed acyclic (once validated) graph over resource logical ids.
///
/// Edges point from a dependent to its dependency.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<LogicalId>,
    edges: BTreeMap<LogicalId, BTreeMap<LogicalId, Edge>>,
}

impl Graph {
    pub(crate) fn build(stack: &Stack) -> Result<Self, Error> {
        let mut nodes = Vec::new();
        let mut edges: BTreeMap<LogicalId, BTreeMap<LogicalId, Edge>> = BTreeMap::new();
        for (id, resource) in stack.resources() {
            nodes.push(id.clone());
            let entry = edges.entry(id.clone()).or_default();
            for target in intrinsic::references(resource.properties()) {
                if !stack.is_declared(&target) {
                    return Err(Error::DanglingReference {
                        from: id.to_string(),
                        to: target,
                    });
                }
                if !stack.is_resource(&target) {
                    // Parameters are resolved before any resource is created
                    continue;
                }
                entry.insert(LogicalId::new(target)?, Edge::Reference);
            }
            for target in resource.dependencies() {
                if !stack.is_resource(target.as_str()) {
                    return Err(Error::DanglingReference {
                        from: id.to_string(),
                        to: target.to_string(),
                    });
                }
                entry.insert(target.clone(), Edge::Explicit);
            }
        }
        Ok(Self { nodes, edges })
    }

    /// Returns the number of resources in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over the direct dependencies of `id`.
    pub fn dependencies(&self, id: &LogicalId) -> impl Iterator<Item = (&LogicalId, Edge)> {
        self.edges
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(|(dep, edge)| (dep, *edge)))
    }

    /// Returns the direct edge from `dependent` to `dependency`, if any.
    pub fn edge(&self, dependent: &LogicalId, dependency: &LogicalId) -> Option<Edge> {
        self.edges.get(dependent)?.get(dependency).copied()
    }

    /// Returns true if `before` must be created before `after` (through any chain of edges).
    pub fn precedes(&self, before: &LogicalId, after: &LogicalId) -> bool {
        self.reaches(after, before, Edge::Reference)
    }

    /// Returns true if a chain of explicit dependencies orders `before` ahead of `after`.
    ///
    /// Orderings that only follow from property references are not counted.
    pub fn precedes_explicitly(&self, before: &LogicalId, after: &LogicalId) -> bool {
        self.reaches(after, before, Edge::Explicit)
    }

    /// Depth-first search from `from` to `to` over edges of at least `strength`.
    fn reaches(&self, from: &LogicalId, to: &LogicalId, strength: Edge) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for (next, edge) in self.dependencies(current) {
                if edge < strength {
                    continue;
                }
                if next == to {
                    return true;
                }
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Returns a creation order in which every resource follows its dependencies.
    ///
    /// Ties are broken by declaration order, so the result is deterministic. If the graph has a
    /// cycle, the error lists the resources along it (first and last entry are the same).
    pub fn order(&self) -> Result<Vec<LogicalId>, Error> {
        let mut emitted: HashSet<&LogicalId> = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        while order.len() < self.nodes.len() {
            let ready = self.nodes.iter().find(|node| {
                !emitted.contains(node) && self.dependencies(node).all(|(dep, _)| emitted.contains(dep))
            });
            match ready {
                Some(node) => {
                    emitted.insert(node);
                    order.push(node.clone());
                }
                None => return Err(Error::Cycle(self.find_cycle(&emitted))),
            }
        }
        Ok(order)
    }

    /// Walk pending dependencies from the first pending node until a node repeats.
    ///
    /// Every pending node has at least one pending dependency, so the walk cannot stall.
    fn find_cycle(&self, emitted: &HashSet<&LogicalId>) -> Vec<String> {
        let Some(mut current) = self.nodes.iter().find(|node| !emitted.contains(node)) else {
            return Vec::new();
        };
        let mut path: Vec<&LogicalId> = Vec::new();
        loop {
            if let Some(start) = path.iter().position(|seen| *seen == current) {
                let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);
            match self
                .dependencies(current)
                .find(|(dep, _)| !emitted.contains(dep))
            {
                Some((next, _)) => current = next,
                None => return path.iter().map(|id| id.to_string()).collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, Parameter, Resource};
    use serde_json::{json, Value};

    fn id(name: &str) -> LogicalId {
        LogicalId::new(name).unwrap()
    }

    /// Vpc <- Subnet <- Cache, Job -(explicit)-> Cache, Job -(ref)-> Subnet
    fn sample() -> Stack {
        let mut stack = Stack::new("Test", Environment::agnostic());
        stack
            .add("Vpc", Resource::new("AWS::EC2::VPC", Value::Null))
            .unwrap();
        stack
            .add(
                "Subnet",
                Resource::new("AWS::EC2::Subnet", json!({"VpcId": {"Ref": "Vpc"}})),
            )
            .unwrap();
        stack
            .add(
                "Cache",
                Resource::new(
                    "AWS::ElastiCache::ReplicationGroup",
                    json!({"Subnets": [{"Ref": "Subnet"}]}),
                ),
            )
            .unwrap();
        stack
            .add(
                "Job",
                Resource::new("AWS::ECS::TaskDefinition", json!({"Subnet": {"Ref": "Subnet"}}))
                    .depends_on(&id("Cache")),
            )
            .unwrap();
        stack
    }

    #[test]
    fn test_edges() {
        let graph = sample().graph().unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edge(&id("Subnet"), &id("Vpc")), Some(Edge::Reference));
        assert_eq!(graph.edge(&id("Job"), &id("Cache")), Some(Edge::Explicit));
        assert_eq!(graph.edge(&id("Vpc"), &id("Subnet")), None);
        assert_eq!(graph.dependencies(&id("Job")).count(), 2);
    }

    #[test]
    fn test_explicit_wins_over_reference() {
        let mut stack = sample();
        stack
            .add(
                "Service",
                Resource::new("AWS::ECS::Service", json!({"Cache": {"Ref": "Cache"}}))
                    .depends_on(&id("Cache")),
            )
            .unwrap();
        let graph = stack.graph().unwrap();
        assert_eq!(graph.edge(&id("Service"), &id("Cache")), Some(Edge::Explicit));
    }

    #[test]
    fn test_precedes() {
        let graph = sample().graph().unwrap();
        assert!(graph.precedes(&id("Vpc"), &id("Job")));
        assert!(graph.precedes(&id("Cache"), &id("Job")));
        assert!(!graph.precedes(&id("Job"), &id("Vpc")));
        assert!(!graph.precedes(&id("Vpc"), &id("Vpc")));

        assert!(graph.precedes_explicitly(&id("Cache"), &id("Job")));
        // Only ordered through references
        assert!(!graph.precedes_explicitly(&id("Vpc"), &id("Job")));
        assert!(!graph.precedes_explicitly(&id("Subnet"), &id("Job")));
    }

    #[test]
    fn test_order_respects_dependencies() {
        let graph = sample().graph().unwrap();
        let order: Vec<String> = graph.order().unwrap().iter().map(|id| id.to_string()).collect();
        assert_eq!(order, vec!["Vpc", "Subnet", "Cache", "Job"]);
    }

    #[test]
    fn test_order_forward_reference() {
        let mut stack = Stack::new("Test", Environment::agnostic());
        stack
            .add(
                "Service",
                Resource::new("AWS::ECS::Service", json!({"Cluster": {"Ref": "Cluster"}})),
            )
            .unwrap();
        stack
            .add("Cluster", Resource::new("AWS::ECS::Cluster", Value::Null))
            .unwrap();
        let order: Vec<String> = stack
            .graph()
            .unwrap()
            .order()
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(order, vec!["Cluster", "Service"]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut stack = Stack::new("Test", Environment::agnostic());
        stack
            .add(
                "A",
                Resource::new("AWS::EC2::SecurityGroup", json!({"Peer": {"Fn::GetAtt": ["B", "GroupId"]}})),
            )
            .unwrap();
        stack
            .add(
                "B",
                Resource::new("AWS::EC2::SecurityGroup", Value::Null).depends_on(&id("A")),
            )
            .unwrap();
        let graph = stack.graph().unwrap();
        assert!(matches!(graph.order(), Err(Error::Cycle(path)) if path == ["A", "B", "A"]));
        assert!(matches!(stack.synthesize(), Err(Error::Cycle(path)) if path == ["A", "B", "A"]));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let mut stack = Stack::new("Test", Environment::agnostic());
        stack
            .add("A", Resource::new("AWS::EC2::VPC", json!({"Self": {"Ref": "A"}})))
            .unwrap();
        assert!(matches!(
            stack.graph().unwrap().order(),
            Err(Error::Cycle(path)) if path == ["A", "A"]
        ));
    }

    #[test]
    fn test_dangling_references() {
        let mut stack = sample();
        stack
            .add(
                "Broken",
                Resource::new("AWS::ECS::Service", json!({"Cluster": {"Ref": "Cluster"}})),
            )
            .unwrap();
        assert!(matches!(
            stack.graph(),
            Err(Error::DanglingReference { from, to }) if from == "Broken" && to == "Cluster"
        ));

        let mut stack = sample();
        stack
            .add(
                "Broken",
                Resource::new("AWS::ECS::Service", Value::Null).depends_on(&id("Cluster")),
            )
            .unwrap();
        assert!(matches!(
            stack.graph(),
            Err(Error::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_parameters_and_pseudo_parameters_are_not_nodes() {
        let mut stack = Stack::new("Test", Environment::agnostic());
        stack.add_parameter("AmiId", Parameter::string()).unwrap();
        stack
            .add(
                "Template",
                Resource::new(
                    "AWS::EC2::LaunchTemplate",
                    json!({"ImageId": {"Ref": "AmiId"}, "Region": {"Ref": "AWS::Region"}}),
                ),
            )
            .unwrap();
        let graph = stack.graph().unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.dependencies(&id("Template")).count(), 0);
    }
}
