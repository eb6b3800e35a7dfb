//! Rendering stack definitions into provider templates.
//!
//! Every reference must point at a parameter or at a resource declared
//! earlier in the stack. `DependsOn` is derived from those references.
//! Composite resources (network, database cluster, load-balanced service)
//! expand into several template resources; the one carrying the declared
//! logical id is the one other resources depend on.

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wpstack_core::pipeline::ActionKind;
use wpstack_core::resource::{
    Expr, LoadBalancedServiceSpec, LogicalId, PseudoParameter, RemovalPolicy, Resource,
    ResourceSpec, StackDefinition,
};

use crate::{SynthError, SynthResult};

pub const FORMAT_VERSION: &str = "2010-09-09";
const POLICY_VERSION: &str = "2012-10-17";
const ANYWHERE: &str = "0.0.0.0/0";
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Parameters", skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, TemplateResource>,
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateResource {
    #[serde(rename = "Type")]
    pub kind: String,
    pub properties: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl TemplateResource {
    fn new(kind: &str, properties: Value) -> Self {
        Self {
            kind: kind.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
        }
    }

    fn deletion_policy(mut self, policy: &str) -> Self {
        self.deletion_policy = Some(policy.to_string());
        self
    }

    fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

impl Template {
    pub fn to_json_pretty(&self) -> SynthResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Render a stack definition, checking every reference along the way.
pub fn synthesize(stack: &StackDefinition) -> SynthResult<Template> {
    let mut renderer = Renderer {
        stack,
        declared: stack.parameters.iter().map(|p| &p.id).collect(),
        resources: BTreeMap::new(),
    };

    let parameters = stack
        .parameters
        .iter()
        .map(|p| {
            let mut value = json!({ "Type": p.kind, "Description": p.description });
            if let Some(default) = &p.default {
                value["Default"] = json!(default);
            }
            (p.id.to_string(), value)
        })
        .collect();

    for resource in &stack.resources {
        renderer.declare(resource)?;
    }

    let mut outputs = BTreeMap::new();
    for output in &stack.outputs {
        let owner = LogicalId::new(output.name.clone());
        for reference in output.value.references() {
            if !renderer.declared.contains(reference) {
                return Err(SynthError::UndeclaredReference {
                    resource: output.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }
        let mut value = json!({ "Value": renderer.expr(&owner, &output.value)? });
        if let Some(description) = &output.description {
            value["Description"] = json!(description);
        }
        outputs.insert(output.name.clone(), value);
    }

    info!(
        stack = %stack.name,
        declared = stack.resources.len(),
        rendered = renderer.resources.len(),
        "Synthesized template"
    );

    Ok(Template {
        format_version: FORMAT_VERSION.to_string(),
        description: stack.description.clone(),
        parameters,
        resources: renderer.resources,
        outputs,
    })
}

/// Write `<dir>/<stack_name>.template.json`, creating `dir` if needed.
pub fn write_template(dir: &Path, stack_name: &str, template: &Template) -> SynthResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.template.json", stack_name));
    let mut json = template.to_json_pretty()?;
    json.push('\n');
    std::fs::write(&path, json)?;
    info!(path = %path.display(), "Wrote template");
    Ok(path)
}

struct Renderer<'a> {
    stack: &'a StackDefinition,
    /// Parameters plus the resources rendered so far.
    declared: HashSet<&'a LogicalId>,
    resources: BTreeMap<String, TemplateResource>,
}

impl<'a> Renderer<'a> {
    fn declare(&mut self, resource: &'a Resource) -> SynthResult<()> {
        let references = resource.spec.references();
        for reference in &references {
            if !self.declared.contains(reference) {
                return Err(SynthError::UndeclaredReference {
                    resource: resource.id.to_string(),
                    reference: reference.to_string(),
                });
            }
        }

        let mut depends_on: Vec<String> = references
            .iter()
            .filter(|r| self.stack.resource(r).is_some())
            .map(|r| r.to_string())
            .collect();
        depends_on.sort();

        let expanded = self.expand(resource)?;
        debug!(
            resource = %resource.id,
            rendered = expanded.len(),
            depends_on = ?depends_on,
            "Rendered resource"
        );

        for (id, mut rendered) in expanded {
            if id == resource.id.as_str() {
                for dep in &depends_on {
                    if !rendered.depends_on.contains(dep) {
                        rendered.depends_on.push(dep.clone());
                    }
                }
            }
            if self.resources.contains_key(&id) {
                return Err(wpstack_core::Error::Conflict(format!(
                    "rendered logical id '{}' from '{}' is already in use",
                    id, resource.id
                ))
                .into());
            }
            self.resources.insert(id, rendered);
        }

        self.declared.insert(&resource.id);
        Ok(())
    }

    fn expand(&self, resource: &Resource) -> SynthResult<Vec<(String, TemplateResource)>> {
        let id = &resource.id;
        let single = |r: TemplateResource| -> SynthResult<Vec<(String, TemplateResource)>> {
            Ok(vec![(id.to_string(), r)])
        };

        match &resource.spec {
            ResourceSpec::SourceRepository { repository_name } => single(TemplateResource::new(
                "AWS::CodeCommit::Repository",
                json!({ "RepositoryName": repository_name }),
            )),
            ResourceSpec::ImageRepository { repository_name } => single(TemplateResource::new(
                "AWS::ECR::Repository",
                json!({ "RepositoryName": repository_name }),
            )),
            ResourceSpec::Vpc { cidr, max_azs } => self.expand_vpc(id, cidr, *max_azs),
            ResourceSpec::Cluster { .. } => {
                single(TemplateResource::new("AWS::ECS::Cluster", json!({})))
            }
            ResourceSpec::LogGroup {
                log_group_name,
                retention_days,
                removal_policy,
            } => single(
                TemplateResource::new(
                    "AWS::Logs::LogGroup",
                    json!({
                        "LogGroupName": log_group_name,
                        "RetentionInDays": retention_days,
                    }),
                )
                .deletion_policy(deletion_policy(*removal_policy)),
            ),
            ResourceSpec::Role {
                role_name,
                assumed_by,
            } => {
                let mut properties = json!({
                    "AssumeRolePolicyDocument": assume_role_document(assumed_by),
                });
                if let Some(name) = role_name {
                    properties["RoleName"] = json!(name);
                }
                single(TemplateResource::new("AWS::IAM::Role", properties))
            }
            ResourceSpec::Policy {
                policy_name,
                roles,
                statements,
            } => {
                let roles = roles
                    .iter()
                    .map(|r| self.expr(id, r))
                    .collect::<SynthResult<Vec<_>>>()?;
                let statements = statements
                    .iter()
                    .map(|s| {
                        let resources = s
                            .resources
                            .iter()
                            .map(|r| self.expr(id, r))
                            .collect::<SynthResult<Vec<_>>>()?;
                        Ok(json!({
                            "Effect": "Allow",
                            "Action": s.actions,
                            "Resource": resources,
                        }))
                    })
                    .collect::<SynthResult<Vec<_>>>()?;
                single(TemplateResource::new(
                    "AWS::IAM::Policy",
                    json!({
                        "PolicyName": policy_name,
                        "Roles": roles,
                        "PolicyDocument": {
                            "Version": POLICY_VERSION,
                            "Statement": statements,
                        },
                    }),
                ))
            }
            ResourceSpec::Secret {
                secret_name,
                exclude_punctuation,
            } => single(TemplateResource::new(
                "AWS::SecretsManager::Secret",
                json!({
                    "Name": secret_name,
                    "GenerateSecretString": { "ExcludePunctuation": exclude_punctuation },
                }),
            )),
            ResourceSpec::DatabaseCluster {
                engine,
                default_database_name,
                master_username,
                master_password,
                instance_class,
                instances,
                vpc,
            } => {
                let subnet_group = format!("{}SubnetGroup", id);
                let security_group = format!("{}SecurityGroup", id);

                let mut out = vec![
                    (
                        subnet_group.clone(),
                        TemplateResource::new(
                            "AWS::RDS::DBSubnetGroup",
                            json!({
                                "DBSubnetGroupDescription": format!("Subnets for {}", id),
                                "SubnetIds": self.attr_of(id, vpc, "PrivateSubnets")?,
                            }),
                        ),
                    ),
                    (
                        security_group.clone(),
                        TemplateResource::new(
                            "AWS::EC2::SecurityGroup",
                            json!({
                                "GroupDescription": format!("{} database", id),
                                "VpcId": self.attr_of(id, vpc, "VpcId")?,
                                "SecurityGroupEgress": [
                                    { "CidrIp": ANYWHERE, "IpProtocol": "-1" }
                                ],
                            }),
                        ),
                    ),
                    (
                        id.to_string(),
                        TemplateResource::new(
                            "AWS::RDS::DBCluster",
                            json!({
                                "Engine": engine,
                                "DatabaseName": default_database_name,
                                "MasterUsername": master_username,
                                "MasterUserPassword": self.expr(id, master_password)?,
                                "DBSubnetGroupName": { "Ref": subnet_group },
                                "VpcSecurityGroupIds": [
                                    { "Fn::GetAtt": [security_group, "GroupId"] }
                                ],
                            }),
                        )
                        .deletion_policy("Snapshot"),
                    ),
                ];
                for n in 1..=*instances {
                    out.push((
                        format!("{}Instance{}", id, n),
                        TemplateResource::new(
                            "AWS::RDS::DBInstance",
                            json!({
                                "DBClusterIdentifier": { "Ref": id },
                                "DBInstanceClass": instance_class,
                                "Engine": engine,
                                "DBSubnetGroupName": { "Ref": subnet_group },
                                "PubliclyAccessible": false,
                            }),
                        )
                        .depends_on(id.to_string()),
                    ));
                }
                Ok(out)
            }
            ResourceSpec::Certificate {
                domain_name,
                hosted_zone,
            } => single(TemplateResource::new(
                "AWS::CertificateManager::Certificate",
                json!({
                    "DomainName": domain_name,
                    "ValidationMethod": "DNS",
                    "DomainValidationOptions": [{
                        "DomainName": domain_name,
                        "HostedZoneId": self.expr(id, hosted_zone)?,
                    }],
                }),
            )),
            ResourceSpec::LoadBalancedService(svc) => self.expand_service(id, svc),
            ResourceSpec::Ingress {
                group,
                source_group,
                port,
                description,
            } => {
                let port = self.expr(id, port)?;
                single(TemplateResource::new(
                    "AWS::EC2::SecurityGroupIngress",
                    json!({
                        "GroupId": self.expr(id, group)?,
                        "SourceSecurityGroupId": self.expr(id, source_group)?,
                        "IpProtocol": "tcp",
                        "FromPort": port,
                        "ToPort": port,
                        "Description": description,
                    }),
                ))
            }
            ResourceSpec::BuildProject {
                description,
                build_image,
                privileged,
                build_spec,
                environment,
                service_role,
            } => {
                let variables = environment
                    .iter()
                    .map(|(name, value)| {
                        Ok(json!({
                            "Name": name,
                            "Type": "PLAINTEXT",
                            "Value": self.expr(id, value)?,
                        }))
                    })
                    .collect::<SynthResult<Vec<_>>>()?;
                single(TemplateResource::new(
                    "AWS::CodeBuild::Project",
                    json!({
                        "Description": description,
                        "Source": { "Type": "CODEPIPELINE", "BuildSpec": build_spec },
                        "Artifacts": { "Type": "CODEPIPELINE" },
                        "Environment": {
                            "Type": "LINUX_CONTAINER",
                            "ComputeType": "BUILD_GENERAL1_SMALL",
                            "Image": build_image,
                            "PrivilegedMode": privileged,
                            "EnvironmentVariables": variables,
                        },
                        "ServiceRole": self.attr_of(id, service_role, "Arn")?,
                    }),
                ))
            }
            ResourceSpec::ArtifactBucket { removal_policy } => single(
                TemplateResource::new("AWS::S3::Bucket", json!({}))
                    .deletion_policy(deletion_policy(*removal_policy)),
            ),
            ResourceSpec::Pipeline {
                name,
                role,
                artifact_bucket,
                stages,
            } => {
                let stages = stages
                    .iter()
                    .map(|stage| {
                        let actions = stage
                            .actions
                            .iter()
                            .map(|action| {
                                let configuration = action
                                    .configuration
                                    .iter()
                                    .map(|(k, v)| Ok((k.clone(), self.expr(id, v)?)))
                                    .collect::<SynthResult<serde_json::Map<_, _>>>()?;
                                let mut rendered = json!({
                                    "Name": action.name,
                                    "ActionTypeId": {
                                        "Category": action_category(action.kind),
                                        "Owner": "AWS",
                                        "Provider": action.provider,
                                        "Version": "1",
                                    },
                                    "Configuration": configuration,
                                    "RunOrder": 1,
                                });
                                if let Some(input) = &action.input {
                                    rendered["InputArtifacts"] = json!([{ "Name": input }]);
                                }
                                if let Some(output) = &action.output {
                                    rendered["OutputArtifacts"] = json!([{ "Name": output }]);
                                }
                                Ok(rendered)
                            })
                            .collect::<SynthResult<Vec<_>>>()?;
                        Ok(json!({ "Name": stage.name, "Actions": actions }))
                    })
                    .collect::<SynthResult<Vec<_>>>()?;
                single(TemplateResource::new(
                    "AWS::CodePipeline::Pipeline",
                    json!({
                        "Name": name,
                        "RoleArn": self.expr(id, role)?,
                        "ArtifactStore": {
                            "Type": "S3",
                            "Location": self.expr(id, artifact_bucket)?,
                        },
                        "Stages": stages,
                    }),
                ))
            }
        }
    }

    fn expand_vpc(
        &self,
        id: &LogicalId,
        cidr: &str,
        max_azs: u32,
    ) -> SynthResult<Vec<(String, TemplateResource)>> {
        let invalid = |message: String| SynthError::InvalidExpression {
            resource: id.to_string(),
            message,
        };
        if max_azs == 0 {
            return Err(invalid("at least one availability zone is required".to_string()));
        }
        let prefix: u32 = cidr
            .split_once('/')
            .and_then(|(_, p)| p.parse().ok())
            .ok_or_else(|| invalid(format!("malformed CIDR block '{}'", cidr)))?;

        // One public and one private subnet per zone.
        let too_many = || invalid(format!("{} availability zones is too many", max_azs));
        let subnet_count = max_azs.checked_mul(2).ok_or_else(too_many)?;
        let subnet_prefix = subnet_count
            .checked_next_power_of_two()
            .and_then(|n| prefix.checked_add(n.trailing_zeros()))
            .ok_or_else(too_many)?;
        if subnet_prefix > 28 {
            return Err(invalid(format!(
                "'{}' is too small for {} subnets",
                cidr, subnet_count
            )));
        }
        let subnet_block = |index: u32| Expr::Select {
            index,
            list: Box::new(Expr::Cidr {
                block: Box::new(Expr::attr(id, "CidrBlock")),
                count: subnet_count,
                bits: 32 - subnet_prefix,
            }),
        };
        let zone = |index: u32| Expr::Select {
            index,
            list: Box::new(Expr::AvailabilityZones),
        };

        let igw = format!("{}IGW", id);
        let attachment = format!("{}VPCGW", id);
        let public_table = format!("{}PublicRouteTable", id);
        let private_table = format!("{}PrivateRouteTable", id);
        let nat_ip = format!("{}NATEIP", id);
        let nat = format!("{}NATGateway", id);

        let mut out = vec![
            (
                id.to_string(),
                TemplateResource::new(
                    "AWS::EC2::VPC",
                    json!({
                        "CidrBlock": cidr,
                        "EnableDnsHostnames": true,
                        "EnableDnsSupport": true,
                        "Tags": [{ "Key": "Name", "Value": format!("{}/{}", self.stack.name, id) }],
                    }),
                ),
            ),
            (igw.clone(), TemplateResource::new("AWS::EC2::InternetGateway", json!({}))),
            (
                attachment.clone(),
                TemplateResource::new(
                    "AWS::EC2::VPCGatewayAttachment",
                    json!({ "VpcId": { "Ref": id }, "InternetGatewayId": { "Ref": igw } }),
                ),
            ),
            (
                public_table.clone(),
                TemplateResource::new("AWS::EC2::RouteTable", json!({ "VpcId": { "Ref": id } })),
            ),
            (
                format!("{}PublicDefaultRoute", id),
                TemplateResource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": { "Ref": public_table },
                        "DestinationCidrBlock": ANYWHERE,
                        "GatewayId": { "Ref": igw },
                    }),
                )
                .depends_on(attachment.clone()),
            ),
        ];

        for az in 0..max_azs {
            let subnet = format!("{}PublicSubnet{}", id, az + 1);
            out.push((
                subnet.clone(),
                TemplateResource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": { "Ref": id },
                        "CidrBlock": self.expr(id, &subnet_block(az))?,
                        "AvailabilityZone": self.expr(id, &zone(az))?,
                        "MapPublicIpOnLaunch": true,
                    }),
                ),
            ));
            out.push((
                format!("{}RouteTableAssociation", subnet),
                TemplateResource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({ "SubnetId": { "Ref": subnet }, "RouteTableId": { "Ref": public_table } }),
                ),
            ));
        }

        // A single NAT gateway in the first public subnet serves every
        // private subnet.
        out.push((
            nat_ip.clone(),
            TemplateResource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" }))
                .depends_on(attachment),
        ));
        out.push((
            nat.clone(),
            TemplateResource::new(
                "AWS::EC2::NatGateway",
                json!({
                    "AllocationId": { "Fn::GetAtt": [nat_ip, "AllocationId"] },
                    "SubnetId": { "Ref": format!("{}PublicSubnet1", id) },
                }),
            ),
        ));
        out.push((
            private_table.clone(),
            TemplateResource::new("AWS::EC2::RouteTable", json!({ "VpcId": { "Ref": id } })),
        ));
        out.push((
            format!("{}PrivateDefaultRoute", id),
            TemplateResource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": { "Ref": private_table },
                    "DestinationCidrBlock": ANYWHERE,
                    "NatGatewayId": { "Ref": nat },
                }),
            ),
        ));

        for az in 0..max_azs {
            let subnet = format!("{}PrivateSubnet{}", id, az + 1);
            out.push((
                subnet.clone(),
                TemplateResource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": { "Ref": id },
                        "CidrBlock": self.expr(id, &subnet_block(max_azs + az))?,
                        "AvailabilityZone": self.expr(id, &zone(az))?,
                        "MapPublicIpOnLaunch": false,
                    }),
                ),
            ));
            out.push((
                format!("{}RouteTableAssociation", subnet),
                TemplateResource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({ "SubnetId": { "Ref": subnet }, "RouteTableId": { "Ref": private_table } }),
                ),
            ));
        }

        Ok(out)
    }

    fn expand_service(
        &self,
        id: &LogicalId,
        svc: &LoadBalancedServiceSpec,
    ) -> SynthResult<Vec<(String, TemplateResource)>> {
        let lb_group = format!("{}LBSecurityGroup", id);
        let lb = format!("{}LB", id);
        let target_group = format!("{}TargetGroup", id);
        let listener = format!("{}HttpsListener", id);
        let execution_role = format!("{}ExecutionRole", id);
        let task_def = format!("{}TaskDef", id);
        let service_group = format!("{}ServiceSecurityGroup", id);

        let vpc_id = self.attr_of(id, &svc.vpc, "VpcId")?;
        let (scheme, lb_subnets) = if svc.public_load_balancer {
            ("internet-facing", self.attr_of(id, &svc.vpc, "PublicSubnets")?)
        } else {
            ("internal", self.attr_of(id, &svc.vpc, "PrivateSubnets")?)
        };

        let environment = svc
            .environment
            .iter()
            .map(|(name, value)| Ok(json!({ "Name": name, "Value": self.expr(id, value)? })))
            .collect::<SynthResult<Vec<_>>>()?;
        let secrets = svc
            .secrets
            .iter()
            .map(|(name, value)| Ok(json!({ "Name": name, "ValueFrom": self.expr(id, value)? })))
            .collect::<SynthResult<Vec<_>>>()?;
        let secret_arns = svc
            .secrets
            .values()
            .map(|value| self.expr(id, value))
            .collect::<SynthResult<Vec<_>>>()?;

        let mut execution_properties = json!({
            "AssumeRolePolicyDocument": assume_role_document("ecs-tasks.amazonaws.com"),
            "ManagedPolicyArns": [self.expr(id, &Expr::join([
                "arn:".into(),
                Expr::Pseudo(PseudoParameter::Partition),
                ":iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy".into(),
            ]))?],
        });
        if !secret_arns.is_empty() {
            execution_properties["Policies"] = json!([{
                "PolicyName": "ReadSecrets",
                "PolicyDocument": {
                    "Version": POLICY_VERSION,
                    "Statement": [{
                        "Effect": "Allow",
                        "Action": ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
                        "Resource": secret_arns,
                    }],
                },
            }]);
        }

        Ok(vec![
            (
                lb_group.clone(),
                TemplateResource::new(
                    "AWS::EC2::SecurityGroup",
                    json!({
                        "GroupDescription": format!("{} load balancer", id),
                        "VpcId": vpc_id,
                        "SecurityGroupIngress": [{
                            "CidrIp": ANYWHERE,
                            "IpProtocol": "tcp",
                            "FromPort": HTTPS_PORT,
                            "ToPort": HTTPS_PORT,
                        }],
                    }),
                ),
            ),
            (
                lb.clone(),
                TemplateResource::new(
                    "AWS::ElasticLoadBalancingV2::LoadBalancer",
                    json!({
                        "Type": "application",
                        "Scheme": scheme,
                        "Subnets": lb_subnets,
                        "SecurityGroups": [{ "Fn::GetAtt": [lb_group, "GroupId"] }],
                    }),
                ),
            ),
            (
                target_group.clone(),
                TemplateResource::new(
                    "AWS::ElasticLoadBalancingV2::TargetGroup",
                    json!({
                        "Port": svc.container_port,
                        "Protocol": "HTTP",
                        "TargetType": "ip",
                        "VpcId": vpc_id,
                    }),
                ),
            ),
            (
                listener.clone(),
                TemplateResource::new(
                    "AWS::ElasticLoadBalancingV2::Listener",
                    json!({
                        "LoadBalancerArn": { "Ref": lb },
                        "Port": HTTPS_PORT,
                        "Protocol": "HTTPS",
                        "Certificates": [{ "CertificateArn": self.expr(id, &svc.certificate)? }],
                        "DefaultActions": [{ "Type": "forward", "TargetGroupArn": { "Ref": target_group } }],
                    }),
                ),
            ),
            (
                format!("{}DNS", id),
                TemplateResource::new(
                    "AWS::Route53::RecordSet",
                    json!({
                        "HostedZoneId": self.expr(id, &svc.domain_zone)?,
                        "Name": svc.domain_name,
                        "Type": "A",
                        "AliasTarget": {
                            "DNSName": { "Fn::GetAtt": [lb, "DNSName"] },
                            "HostedZoneId": { "Fn::GetAtt": [lb, "CanonicalHostedZoneID"] },
                        },
                    }),
                ),
            ),
            (
                execution_role.clone(),
                TemplateResource::new("AWS::IAM::Role", execution_properties),
            ),
            (
                task_def.clone(),
                TemplateResource::new(
                    "AWS::ECS::TaskDefinition",
                    json!({
                        "Family": format!("{}{}", self.stack.name, id),
                        "Cpu": svc.cpu.to_string(),
                        "Memory": svc.memory_mib.to_string(),
                        "NetworkMode": "awsvpc",
                        "RequiresCompatibilities": ["FARGATE"],
                        "TaskRoleArn": self.attr_of(id, &svc.task_role, "Arn")?,
                        "ExecutionRoleArn": { "Fn::GetAtt": [execution_role, "Arn"] },
                        "ContainerDefinitions": [{
                            "Name": svc.container_name,
                            "Image": self.expr(id, &svc.image)?,
                            "Essential": true,
                            "PortMappings": [{ "ContainerPort": svc.container_port, "Protocol": "tcp" }],
                            "Environment": environment,
                            "Secrets": secrets,
                            "LogConfiguration": {
                                "LogDriver": "awslogs",
                                "Options": {
                                    "awslogs-group": self.expr(id, &svc.log_group)?,
                                    "awslogs-stream-prefix": svc.stream_prefix,
                                    "awslogs-region": self.expr(id, &Expr::Pseudo(PseudoParameter::Region))?,
                                },
                            },
                        }],
                    }),
                ),
            ),
            (
                service_group.clone(),
                TemplateResource::new(
                    "AWS::EC2::SecurityGroup",
                    json!({
                        "GroupDescription": format!("{} tasks", id),
                        "VpcId": vpc_id,
                        "SecurityGroupIngress": [{
                            "IpProtocol": "tcp",
                            "FromPort": svc.container_port,
                            "ToPort": svc.container_port,
                            "SourceSecurityGroupId": { "Fn::GetAtt": [lb_group, "GroupId"] },
                        }],
                    }),
                ),
            ),
            (
                id.to_string(),
                TemplateResource::new(
                    "AWS::ECS::Service",
                    json!({
                        "Cluster": self.expr(id, &svc.cluster)?,
                        "LaunchType": "FARGATE",
                        "DesiredCount": svc.desired_count,
                        "TaskDefinition": { "Ref": task_def },
                        "HealthCheckGracePeriodSeconds": 60,
                        "LoadBalancers": [{
                            "ContainerName": svc.container_name,
                            "ContainerPort": svc.container_port,
                            "TargetGroupArn": { "Ref": target_group },
                        }],
                        "NetworkConfiguration": {
                            "AwsvpcConfiguration": {
                                "AssignPublicIp": "DISABLED",
                                "Subnets": self.attr_of(id, &svc.vpc, "PrivateSubnets")?,
                                "SecurityGroups": [{ "Fn::GetAtt": [service_group, "GroupId"] }],
                            },
                        },
                    }),
                )
                .depends_on(listener),
            ),
        ])
    }

    fn expr(&self, owner: &LogicalId, expr: &Expr) -> SynthResult<Value> {
        Ok(match expr {
            Expr::Literal(value) => json!(value),
            Expr::Ref(id) => json!({ "Ref": id }),
            Expr::Attr {
                resource,
                attribute,
            } => self.attribute(resource, attribute)?,
            Expr::Join(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| self.expr(owner, p))
                    .collect::<SynthResult<Vec<_>>>()?;
                json!({ "Fn::Join": ["", parts] })
            }
            Expr::Pseudo(p) => json!({ "Ref": pseudo_name(*p) }),
            Expr::Select { index, list } => {
                json!({ "Fn::Select": [index, self.expr(owner, list)?] })
            }
            Expr::AvailabilityZones => json!({ "Fn::GetAZs": "" }),
            Expr::Cidr { block, count, bits } => {
                json!({ "Fn::Cidr": [self.expr(owner, block)?, count, bits] })
            }
        })
    }

    /// Resolve `attribute` of the resource `expr` refers to.
    fn attr_of(&self, owner: &LogicalId, expr: &Expr, attribute: &str) -> SynthResult<Value> {
        match expr {
            Expr::Ref(id) => self.attribute(id, attribute),
            other => Err(SynthError::InvalidExpression {
                resource: owner.to_string(),
                message: format!("expected a resource reference, found {:?}", other),
            }),
        }
    }

    fn attribute(&self, id: &LogicalId, attribute: &str) -> SynthResult<Value> {
        let unknown = || SynthError::UnknownAttribute {
            resource: id.to_string(),
            attribute: attribute.to_string(),
        };
        let spec = &self.stack.resource(id).ok_or_else(unknown)?.spec;
        let get_att = |target: &str, name: &str| json!({ "Fn::GetAtt": [target, name] });

        let value = match (spec, attribute) {
            (ResourceSpec::Vpc { .. }, "VpcId") => json!({ "Ref": id }),
            (ResourceSpec::Vpc { .. }, "CidrBlock") => get_att(id.as_str(), "CidrBlock"),
            (ResourceSpec::Vpc { max_azs, .. }, "PublicSubnets" | "PrivateSubnets") => {
                let kind = attribute.trim_end_matches('s');
                json!(
                    (1..=*max_azs)
                        .map(|n| json!({ "Ref": format!("{}{}{}", id, kind, n) }))
                        .collect::<Vec<_>>()
                )
            }
            (ResourceSpec::DatabaseCluster { .. }, "Endpoint.Address" | "Endpoint.Port") => {
                get_att(id.as_str(), attribute)
            }
            (ResourceSpec::DatabaseCluster { .. }, "SecurityGroupId") => {
                get_att(format!("{}SecurityGroup", id).as_str(), "GroupId")
            }
            (ResourceSpec::LoadBalancedService(_), "ServiceName") => get_att(id.as_str(), "Name"),
            (ResourceSpec::LoadBalancedService(_), "SecurityGroupId") => {
                get_att(format!("{}ServiceSecurityGroup", id).as_str(), "GroupId")
            }
            (ResourceSpec::LoadBalancedService(_), "LoadBalancerDnsName") => {
                get_att(format!("{}LB", id).as_str(), "DNSName")
            }
            (spec, attribute) if plain_attributes(spec).iter().any(|a| *a == attribute) => {
                get_att(id.as_str(), attribute)
            }
            _ => return Err(unknown()),
        };
        Ok(value)
    }
}

/// Attributes passed straight through to the provider.
fn plain_attributes(spec: &ResourceSpec) -> &'static [&'static str] {
    match spec {
        ResourceSpec::SourceRepository { .. } => &["Arn", "CloneUrlHttp", "CloneUrlSsh", "Name"],
        ResourceSpec::ImageRepository { .. } => &["Arn", "RepositoryUri"],
        ResourceSpec::Cluster { .. } | ResourceSpec::LogGroup { .. } => &["Arn"],
        ResourceSpec::Role { .. } => &["Arn", "RoleId"],
        ResourceSpec::BuildProject { .. } => &["Arn"],
        ResourceSpec::ArtifactBucket { .. } => &["Arn", "DomainName"],
        ResourceSpec::Pipeline { .. } => &["Version"],
        _ => &[],
    }
}

fn assume_role_document(service: &str) -> Value {
    json!({
        "Version": POLICY_VERSION,
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": service },
        }],
    })
}

fn deletion_policy(policy: RemovalPolicy) -> &'static str {
    match policy {
        RemovalPolicy::Retain => "Retain",
        RemovalPolicy::Destroy => "Delete",
    }
}

fn pseudo_name(p: PseudoParameter) -> &'static str {
    match p {
        PseudoParameter::AccountId => "AWS::AccountId",
        PseudoParameter::Region => "AWS::Region",
        PseudoParameter::Partition => "AWS::Partition",
        PseudoParameter::StackName => "AWS::StackName",
    }
}

fn action_category(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Source => "Source",
        ActionKind::Build => "Build",
        ActionKind::Deploy => "Deploy",
    }
}
