//! Desired-resource value objects.
//!
//! A [`StackDefinition`] describes what should exist in one deployable
//! unit. It carries no provider logic: turning a definition into a
//! deployment template is the job of a synthesizer.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::ActionKind;
use crate::{Error, Result};

/// Identifier of a resource or parameter within a stack.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogicalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Values only known to the provider at deploy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PseudoParameter {
    AccountId,
    Region,
    Partition,
    StackName,
}

/// A property value, possibly referring to other resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Literal(String),
    /// The primary identifier of a resource or the value of a parameter.
    Ref(LogicalId),
    /// A named attribute of a resource.
    Attr {
        resource: LogicalId,
        attribute: String,
    },
    /// Concatenation without separator.
    Join(Vec<Expr>),
    Pseudo(PseudoParameter),
    /// Element of a list-valued expression.
    Select { index: u32, list: Box<Expr> },
    /// Availability zones of the deployment region.
    AvailabilityZones,
    /// `count` sub-blocks of `block`, each with `bits` host bits.
    Cidr {
        block: Box<Expr>,
        count: u32,
        bits: u32,
    },
}

impl Expr {
    pub fn literal(value: impl Into<String>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(id: &LogicalId) -> Self {
        Expr::Ref(id.clone())
    }

    pub fn attr(id: &LogicalId, attribute: impl Into<String>) -> Self {
        Expr::Attr {
            resource: id.clone(),
            attribute: attribute.into(),
        }
    }

    pub fn join(parts: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Join(parts.into_iter().collect())
    }

    /// Logical ids this expression depends on.
    pub fn references(&self) -> Vec<&LogicalId> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a LogicalId>) {
        match self {
            Expr::Ref(id) => out.push(id),
            Expr::Attr { resource, .. } => out.push(resource),
            Expr::Join(parts) => parts.iter().for_each(|p| p.collect_references(out)),
            Expr::Select { list, .. } => list.collect_references(out),
            Expr::Cidr { block, .. } => block.collect_references(out),
            Expr::Literal(_) | Expr::Pseudo(_) | Expr::AvailabilityZones => {}
        }
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(value)
    }
}

/// What happens to a resource when its stack is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemovalPolicy {
    #[default]
    Retain,
    Destroy,
}

/// One statement of an access policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Expr>,
}

/// A container service behind a public load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancedServiceSpec {
    pub cluster: Expr,
    pub vpc: Expr,
    pub image: Expr,
    pub container_name: String,
    pub container_port: u16,
    pub memory_mib: u32,
    pub cpu: u32,
    pub desired_count: u32,
    pub public_load_balancer: bool,
    /// Record name routed to the load balancer.
    pub domain_name: String,
    pub domain_zone: Expr,
    pub certificate: Expr,
    pub log_group: Expr,
    pub stream_prefix: String,
    pub task_role: Expr,
    pub environment: BTreeMap<String, Expr>,
    pub secrets: BTreeMap<String, Expr>,
}

/// An action inside a declared delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineActionSpec {
    pub name: String,
    pub kind: ActionKind,
    /// Provider-side action type (e.g., "CodeBuild").
    pub provider: String,
    pub configuration: BTreeMap<String, Expr>,
    pub input: Option<String>,
    pub output: Option<String>,
}

/// A stage inside a declared delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStageSpec {
    pub name: String,
    pub actions: Vec<PipelineActionSpec>,
}

/// Typed description of a desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceSpec {
    SourceRepository {
        repository_name: String,
    },
    ImageRepository {
        repository_name: String,
    },
    Vpc {
        cidr: String,
        max_azs: u32,
    },
    Cluster {
        vpc: Expr,
    },
    LogGroup {
        log_group_name: String,
        retention_days: u32,
        removal_policy: RemovalPolicy,
    },
    Role {
        role_name: Option<String>,
        assumed_by: String,
    },
    Policy {
        policy_name: String,
        roles: Vec<Expr>,
        statements: Vec<PolicyStatement>,
    },
    Secret {
        secret_name: String,
        exclude_punctuation: bool,
    },
    DatabaseCluster {
        engine: String,
        default_database_name: String,
        master_username: String,
        master_password: Expr,
        instance_class: String,
        instances: u32,
        vpc: Expr,
    },
    Certificate {
        domain_name: String,
        hosted_zone: Expr,
    },
    LoadBalancedService(Box<LoadBalancedServiceSpec>),
    /// Allow traffic from one security group into another.
    Ingress {
        group: Expr,
        source_group: Expr,
        port: Expr,
        description: String,
    },
    BuildProject {
        description: String,
        build_image: String,
        privileged: bool,
        build_spec: String,
        environment: BTreeMap<String, Expr>,
        service_role: Expr,
    },
    ArtifactBucket {
        removal_policy: RemovalPolicy,
    },
    Pipeline {
        name: String,
        role: Expr,
        artifact_bucket: Expr,
        stages: Vec<PipelineStageSpec>,
    },
}

impl ResourceSpec {
    /// Every expression held by this resource.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            ResourceSpec::SourceRepository { .. }
            | ResourceSpec::ImageRepository { .. }
            | ResourceSpec::Vpc { .. }
            | ResourceSpec::LogGroup { .. }
            | ResourceSpec::Role { .. }
            | ResourceSpec::Secret { .. }
            | ResourceSpec::ArtifactBucket { .. } => Vec::new(),
            ResourceSpec::Cluster { vpc } => vec![vpc],
            ResourceSpec::Policy {
                roles, statements, ..
            } => roles
                .iter()
                .chain(statements.iter().flat_map(|s| s.resources.iter()))
                .collect(),
            ResourceSpec::DatabaseCluster {
                master_password,
                vpc,
                ..
            } => vec![master_password, vpc],
            ResourceSpec::Certificate { hosted_zone, .. } => vec![hosted_zone],
            ResourceSpec::LoadBalancedService(svc) => {
                let mut exprs = vec![
                    &svc.cluster,
                    &svc.vpc,
                    &svc.image,
                    &svc.domain_zone,
                    &svc.certificate,
                    &svc.log_group,
                    &svc.task_role,
                ];
                exprs.extend(svc.environment.values());
                exprs.extend(svc.secrets.values());
                exprs
            }
            ResourceSpec::Ingress {
                group,
                source_group,
                port,
                ..
            } => vec![group, source_group, port],
            ResourceSpec::BuildProject {
                environment,
                service_role,
                ..
            } => {
                let mut exprs = vec![service_role];
                exprs.extend(environment.values());
                exprs
            }
            ResourceSpec::Pipeline {
                role,
                artifact_bucket,
                stages,
                ..
            } => {
                let mut exprs = vec![role, artifact_bucket];
                for stage in stages {
                    for action in &stage.actions {
                        exprs.extend(action.configuration.values());
                    }
                }
                exprs
            }
        }
    }

    /// Logical ids this resource depends on, deduplicated in first-use order.
    pub fn references(&self) -> Vec<&LogicalId> {
        let mut refs: Vec<&LogicalId> = Vec::new();
        for id in self.expressions().into_iter().flat_map(|e| e.references()) {
            if !refs.contains(&id) {
                refs.push(id);
            }
        }
        refs
    }
}

/// A desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: LogicalId,
    pub spec: ResourceSpec,
}

/// A value supplied to the stack at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: LogicalId,
    /// Provider parameter type (e.g., "String").
    pub kind: String,
    pub description: String,
    pub default: Option<String>,
}

/// A named value exposed by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub value: Expr,
    pub description: Option<String>,
}

/// All desired resources of one deployable unit, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Vec<Parameter>,
    pub resources: Vec<Resource>,
    pub outputs: Vec<Output>,
}

impl StackDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: Vec::new(),
            resources: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn ensure_unused(&self, id: &LogicalId) -> Result<()> {
        if self.contains(id) {
            return Err(Error::Conflict(format!(
                "logical id '{}' declared twice in stack '{}'",
                id, self.name
            )));
        }
        Ok(())
    }

    pub fn contains(&self, id: &LogicalId) -> bool {
        self.resources.iter().any(|r| &r.id == id) || self.parameters.iter().any(|p| &p.id == id)
    }

    pub fn resource(&self, id: &LogicalId) -> Option<&Resource> {
        self.resources.iter().find(|r| &r.id == id)
    }

    /// Declare a resource, returning its logical id.
    pub fn add(&mut self, id: impl Into<LogicalId>, spec: ResourceSpec) -> Result<LogicalId> {
        let id = id.into();
        self.ensure_unused(&id)?;
        self.resources.push(Resource {
            id: id.clone(),
            spec,
        });
        Ok(id)
    }

    /// Declare a parameter, returning its logical id.
    pub fn add_parameter(
        &mut self,
        id: impl Into<LogicalId>,
        kind: impl Into<String>,
        description: impl Into<String>,
        default: Option<String>,
    ) -> Result<LogicalId> {
        let id = id.into();
        self.ensure_unused(&id)?;
        self.parameters.push(Parameter {
            id: id.clone(),
            kind: kind.into(),
            description: description.into(),
            default,
        });
        Ok(id)
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: Expr) -> Result<()> {
        let name = name.into();
        if self.outputs.iter().any(|o| o.name == name) {
            return Err(Error::Conflict(format!("output '{}' declared twice", name)));
        }
        self.outputs.push(Output {
            name,
            value,
            description: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_references() {
        let vpc = LogicalId::new("Vpc");
        let expr = Expr::join([
            Expr::Pseudo(PseudoParameter::AccountId),
            ".dkr.ecr.".into(),
            Expr::attr(&vpc, "CidrBlock"),
            Expr::Select {
                index: 0,
                list: Box::new(Expr::reference(&LogicalId::new("Subnets"))),
            },
        ]);
        let refs: Vec<_> = expr.references().into_iter().map(|r| r.as_str()).collect();
        assert_eq!(refs, vec!["Vpc", "Subnets"]);
    }

    #[test]
    fn test_duplicate_logical_ids_rejected() {
        let mut stack = StackDefinition::new("Test");
        stack
            .add(
                "Repo",
                ResourceSpec::ImageRepository {
                    repository_name: "wordpress".to_string(),
                },
            )
            .unwrap();
        let err = stack
            .add_parameter("Repo", "String", "clash", None)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_resource_references_are_deduplicated() {
        let vpc = LogicalId::new("Vpc");
        let spec = ResourceSpec::DatabaseCluster {
            engine: "aurora".to_string(),
            default_database_name: "wordpress".to_string(),
            master_username: "root".to_string(),
            master_password: Expr::reference(&LogicalId::new("Secret")),
            instance_class: "db.t3.small".to_string(),
            instances: 2,
            vpc: Expr::reference(&vpc),
        };
        let refs: Vec<_> = spec.references().into_iter().map(|r| r.as_str()).collect();
        assert_eq!(refs, vec!["Secret", "Vpc"]);
    }
}
