//! The WordPress service and the pipeline that delivers it.

use std::collections::BTreeMap;
use tracing::{debug, info};
use wpstack_config::pipeline::validate_pipeline;
use wpstack_config::{BuildSpec, DeploymentSettings};
use wpstack_core::artifact::IMAGE_DEFINITIONS_FILE;
use wpstack_core::pipeline::{ActionConfig, PipelineDefinition};
use wpstack_core::resource::{
    Expr, LoadBalancedServiceSpec, LogicalId, PipelineActionSpec, PipelineStageSpec,
    PolicyStatement, PseudoParameter, RemovalPolicy, ResourceSpec, StackDefinition,
};

use crate::SynthResult;

pub const HOSTED_ZONE_PARAMETER: &str = "HostedZoneId";
pub const BUILD_IMAGE: &str = "aws/codebuild/standard:3.0";

pub const DB_NAME: &str = "wordpress";
pub const DB_USER: &str = "root";
pub const DB_SECRET_NAME: &str = "wordpressDBPassword";
pub const DB_INSTANCE_CLASS: &str = "db.t3.small";
pub const DB_INSTANCES: u32 = 2;

pub const CONTAINER_PORT: u16 = 80;
pub const MEMORY_MIB: u32 = 1024;
pub const CPU_UNITS: u32 = 512;
pub const DESIRED_COUNT: u32 = 1;
pub const LOG_RETENTION_DAYS: u32 = 7;

/// Network, database, service and delivery pipeline for one domain.
#[derive(Debug, Clone)]
pub struct PipelineStack {
    definition: StackDefinition,
}

impl PipelineStack {
    pub fn new(
        settings: &DeploymentSettings,
        pipeline: &PipelineDefinition,
        build_spec: &BuildSpec,
    ) -> SynthResult<Self> {
        validate_pipeline(pipeline)?;
        build_spec.validate()?;

        let app = settings.app_name.as_str();
        let mut stack = StackDefinition::new(format!("{}PipelineStack", app));
        stack.description = Some(format!(
            "{} on Fargate at {}, delivered by {}",
            app,
            settings.service_domain(),
            pipeline.name
        ));

        let hosted_zone = stack.add_parameter(
            HOSTED_ZONE_PARAMETER,
            "AWS::Route53::HostedZone::Id",
            format!("Hosted zone of {}", settings.domain_name),
            None,
        )?;

        let vpc = stack.add(
            "vpc",
            ResourceSpec::Vpc {
                cidr: settings.cidr.clone(),
                max_azs: settings.max_azs,
            },
        )?;
        let cluster = stack.add(
            "cluster",
            ResourceSpec::Cluster {
                vpc: Expr::reference(&vpc),
            },
        )?;
        let log_group = stack.add(
            "LogGroup",
            ResourceSpec::LogGroup {
                log_group_name: format!("{}Fargate", app),
                retention_days: LOG_RETENTION_DAYS,
                removal_policy: RemovalPolicy::Destroy,
            },
        )?;
        let task_role = stack.add(
            "FargateTaskRole",
            ResourceSpec::Role {
                role_name: Some(format!("{}FargateTaskRole", app)),
                assumed_by: "ecs-tasks.amazonaws.com".to_string(),
            },
        )?;
        let secret = stack.add(
            "DBSecret",
            ResourceSpec::Secret {
                secret_name: DB_SECRET_NAME.to_string(),
                exclude_punctuation: true,
            },
        )?;
        let db = stack.add(
            "Database",
            ResourceSpec::DatabaseCluster {
                engine: "aurora".to_string(),
                default_database_name: DB_NAME.to_string(),
                master_username: DB_USER.to_string(),
                master_password: Expr::join([
                    "{{resolve:secretsmanager:".into(),
                    Expr::reference(&secret),
                    ":SecretString:::}}".into(),
                ]),
                instance_class: DB_INSTANCE_CLASS.to_string(),
                instances: DB_INSTANCES,
                vpc: Expr::reference(&vpc),
            },
        )?;
        let cert = stack.add(
            "WordpressCert",
            ResourceSpec::Certificate {
                domain_name: settings.certificate_domain(),
                hosted_zone: Expr::reference(&hosted_zone),
            },
        )?;

        let image_uri = repository_uri(&settings.image_repository);
        let service = stack.add(
            wpstack_config::pipeline::SERVICE,
            ResourceSpec::LoadBalancedService(Box::new(LoadBalancedServiceSpec {
                cluster: Expr::reference(&cluster),
                vpc: Expr::reference(&vpc),
                image: image_uri.clone(),
                container_name: wpstack_core::artifact::WEB_CONTAINER.to_string(),
                container_port: CONTAINER_PORT,
                memory_mib: MEMORY_MIB,
                cpu: CPU_UNITS,
                desired_count: DESIRED_COUNT,
                public_load_balancer: true,
                domain_name: settings.service_domain(),
                domain_zone: Expr::reference(&hosted_zone),
                certificate: Expr::reference(&cert),
                log_group: Expr::reference(&log_group),
                stream_prefix: app.to_string(),
                task_role: Expr::reference(&task_role),
                environment: BTreeMap::from([
                    ("WORDPRESS_DB_USER".to_string(), Expr::literal(DB_USER)),
                    (
                        "WORDPRESS_DB_HOST".to_string(),
                        Expr::attr(&db, "Endpoint.Address"),
                    ),
                    ("WORDPRESS_DB_NAME".to_string(), Expr::literal(DB_NAME)),
                ]),
                secrets: BTreeMap::from([(
                    "WORDPRESS_DB_PASSWORD".to_string(),
                    Expr::reference(&secret),
                )]),
            })),
        )?;

        stack.add(
            "DatabaseIngressFromFargate",
            ResourceSpec::Ingress {
                group: Expr::attr(&db, "SecurityGroupId"),
                source_group: Expr::attr(&service, "SecurityGroupId"),
                port: Expr::attr(&db, "Endpoint.Port"),
                description: "From Fargate".to_string(),
            },
        )?;

        let build_role = stack.add(
            "BuildRole",
            ResourceSpec::Role {
                role_name: None,
                assumed_by: "codebuild.amazonaws.com".to_string(),
            },
        )?;
        let build_project = stack.add(
            wpstack_config::pipeline::BUILD_PROJECT,
            ResourceSpec::BuildProject {
                description: format!("Build project for the {} pipeline", app),
                build_image: BUILD_IMAGE.to_string(),
                privileged: true,
                build_spec: serde_json::to_string_pretty(&build_spec.render_hosted())?,
                environment: BTreeMap::from([
                    (
                        "ACCOUNT_ID".to_string(),
                        Expr::Pseudo(PseudoParameter::AccountId),
                    ),
                    (
                        "ECR_REPOSITORY_NAME".to_string(),
                        Expr::literal(settings.image_repository.clone()),
                    ),
                    ("ECR_REPOSITORY_URI".to_string(), image_uri),
                ]),
                service_role: Expr::reference(&build_role),
            },
        )?;

        let artifact_bucket = stack.add(
            "ArtifactsBucket",
            ResourceSpec::ArtifactBucket {
                removal_policy: RemovalPolicy::Retain,
            },
        )?;

        stack.add(
            "BuildRolePolicy",
            ResourceSpec::Policy {
                policy_name: format!("{}BuildPolicy", app),
                roles: vec![Expr::reference(&build_role)],
                statements: vec![
                    PolicyStatement {
                        actions: vec!["ecr:GetAuthorizationToken".to_string()],
                        resources: vec!["*".into()],
                    },
                    // pull and push on the image repository
                    PolicyStatement {
                        actions: [
                            "ecr:BatchCheckLayerAvailability",
                            "ecr:GetDownloadUrlForLayer",
                            "ecr:BatchGetImage",
                            "ecr:PutImage",
                            "ecr:InitiateLayerUpload",
                            "ecr:UploadLayerPart",
                            "ecr:CompleteLayerUpload",
                        ]
                        .iter()
                        .map(|a| a.to_string())
                        .collect(),
                        resources: vec![repository_arn(&settings.image_repository)],
                    },
                    PolicyStatement {
                        actions: vec![
                            "logs:CreateLogGroup".to_string(),
                            "logs:CreateLogStream".to_string(),
                            "logs:PutLogEvents".to_string(),
                        ],
                        resources: vec!["*".into()],
                    },
                    PolicyStatement {
                        actions: vec![
                            "s3:GetObject".to_string(),
                            "s3:PutObject".to_string(),
                        ],
                        resources: vec![Expr::join([
                            Expr::attr(&artifact_bucket, "Arn"),
                            "/*".into(),
                        ])],
                    },
                ],
            },
        )?;

        let pipeline_role = stack.add(
            "PipelineRole",
            ResourceSpec::Role {
                role_name: None,
                assumed_by: "codepipeline.amazonaws.com".to_string(),
            },
        )?;
        stack.add(
            "PipelineRolePolicy",
            ResourceSpec::Policy {
                policy_name: format!("{}PipelinePolicy", app),
                roles: vec![Expr::reference(&pipeline_role)],
                statements: vec![
                    PolicyStatement {
                        actions: vec![
                            "s3:GetObject".to_string(),
                            "s3:PutObject".to_string(),
                            "s3:GetBucketLocation".to_string(),
                        ],
                        resources: vec![
                            Expr::attr(&artifact_bucket, "Arn"),
                            Expr::join([Expr::attr(&artifact_bucket, "Arn"), "/*".into()]),
                        ],
                    },
                    PolicyStatement {
                        actions: vec![
                            "codecommit:GetBranch".to_string(),
                            "codecommit:GetCommit".to_string(),
                            "codecommit:UploadArchive".to_string(),
                            "codecommit:GetUploadArchiveStatus".to_string(),
                        ],
                        resources: vec![source_repository_arn(&settings.source_repository)],
                    },
                    PolicyStatement {
                        actions: vec![
                            "codebuild:StartBuild".to_string(),
                            "codebuild:BatchGetBuilds".to_string(),
                        ],
                        resources: vec![Expr::attr(&build_project, "Arn")],
                    },
                    PolicyStatement {
                        actions: vec![
                            "ecs:DescribeServices".to_string(),
                            "ecs:DescribeTaskDefinition".to_string(),
                            "ecs:DescribeTasks".to_string(),
                            "ecs:ListTasks".to_string(),
                            "ecs:RegisterTaskDefinition".to_string(),
                            "ecs:UpdateService".to_string(),
                            "iam:PassRole".to_string(),
                        ],
                        resources: vec!["*".into()],
                    },
                ],
            },
        )?;

        let stages = pipeline
            .stages
            .iter()
            .map(|stage| PipelineStageSpec {
                name: stage.name.clone(),
                actions: stage
                    .actions
                    .iter()
                    .map(|action| {
                        let (provider, configuration) =
                            action_configuration(&action.config, &cluster);
                        PipelineActionSpec {
                            name: action.name.clone(),
                            kind: action.kind(),
                            provider: provider.to_string(),
                            configuration,
                            input: action.input.as_ref().map(|a| a.to_string()),
                            output: action.output.as_ref().map(|a| a.to_string()),
                        }
                    })
                    .collect(),
            })
            .collect();

        stack.add(
            pipeline.name.as_str(),
            ResourceSpec::Pipeline {
                name: pipeline.name.clone(),
                role: Expr::attr(&pipeline_role, "Arn"),
                artifact_bucket: Expr::reference(&artifact_bucket),
                stages,
            },
        )?;

        stack.add_output(
            "ServiceUrl",
            Expr::literal(format!("https://{}", settings.service_domain())),
        )?;
        stack.add_output(
            "LoadBalancerDnsName",
            Expr::attr(&service, "LoadBalancerDnsName"),
        )?;

        info!(
            stack = %stack.name,
            resources = stack.resources.len(),
            domain = %settings.service_domain(),
            "Assembled pipeline stack"
        );

        Ok(Self { definition: stack })
    }

    pub fn definition(&self) -> &StackDefinition {
        &self.definition
    }

    pub fn into_definition(self) -> StackDefinition {
        self.definition
    }
}

/// Address of an image repository in the deploying account and region.
fn repository_uri(repository_name: &str) -> Expr {
    Expr::join([
        Expr::Pseudo(PseudoParameter::AccountId),
        ".dkr.ecr.".into(),
        Expr::Pseudo(PseudoParameter::Region),
        ".amazonaws.com/".into(),
        repository_name.into(),
    ])
}

fn repository_arn(repository_name: &str) -> Expr {
    Expr::join([
        "arn:".into(),
        Expr::Pseudo(PseudoParameter::Partition),
        ":ecr:".into(),
        Expr::Pseudo(PseudoParameter::Region),
        ":".into(),
        Expr::Pseudo(PseudoParameter::AccountId),
        ":repository/".into(),
        repository_name.into(),
    ])
}

fn source_repository_arn(repository_name: &str) -> Expr {
    Expr::join([
        "arn:".into(),
        Expr::Pseudo(PseudoParameter::Partition),
        ":codecommit:".into(),
        Expr::Pseudo(PseudoParameter::Region),
        ":".into(),
        Expr::Pseudo(PseudoParameter::AccountId),
        ":".into(),
        repository_name.into(),
    ])
}

/// Provider action type and configuration for one pipeline action.
fn action_configuration(
    config: &ActionConfig,
    cluster: &LogicalId,
) -> (&'static str, BTreeMap<String, Expr>) {
    match config {
        ActionConfig::Source { repository, branch } => {
            debug!(repository = %repository, branch = %branch, "Mapping source action");
            (
                "CodeCommit",
                BTreeMap::from([
                    ("RepositoryName".to_string(), Expr::literal(repository.clone())),
                    ("BranchName".to_string(), Expr::literal(branch.clone())),
                ]),
            )
        }
        ActionConfig::Build { project } => (
            "CodeBuild",
            BTreeMap::from([(
                "ProjectName".to_string(),
                Expr::reference(&LogicalId::new(project.clone())),
            )]),
        ),
        ActionConfig::Deploy { service } => (
            "ECS",
            BTreeMap::from([
                ("ClusterName".to_string(), Expr::reference(cluster)),
                (
                    "ServiceName".to_string(),
                    Expr::attr(&LogicalId::new(service.clone()), "ServiceName"),
                ),
                (
                    "FileName".to_string(),
                    Expr::literal(IMAGE_DEFINITIONS_FILE),
                ),
            ]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SynthError, synthesize};
    use serde_json::{Value, json};
    use wpstack_config::PartialSettings;
    use wpstack_config::pipeline::wordpress_pipeline;

    fn settings() -> DeploymentSettings {
        PartialSettings {
            domain_name: Some("example.com".to_string()),
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    fn template(settings: &DeploymentSettings) -> Value {
        let pipeline = wordpress_pipeline(settings).unwrap();
        let stack = PipelineStack::new(settings, &pipeline, &BuildSpec::wordpress()).unwrap();
        serde_json::to_value(synthesize(stack.definition()).unwrap()).unwrap()
    }

    #[test]
    fn test_stack_name_and_declaration_order() {
        let settings = settings();
        let pipeline = wordpress_pipeline(&settings).unwrap();
        let stack = PipelineStack::new(&settings, &pipeline, &BuildSpec::wordpress()).unwrap();
        let def = stack.definition();

        assert_eq!(def.name, "WordpressPipelineStack");
        let ids: Vec<_> = def.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(&ids[..3], &["vpc", "cluster", "LogGroup"]);
        assert_eq!(ids.last(), Some(&"WordpressPipeline"));
        let service = ids.iter().position(|id| *id == "WordpressService").unwrap();
        let database = ids.iter().position(|id| *id == "Database").unwrap();
        assert!(database < service);
    }

    #[test]
    fn test_service_uses_default_subdomain() {
        let json = template(&settings());

        let record = &json["Resources"]["WordpressServiceDNS"]["Properties"];
        assert_eq!(record["Name"], "wordpress.example.com");

        let cert = &json["Resources"]["WordpressCert"]["Properties"];
        assert_eq!(cert["DomainName"], "*.example.com");
        assert_eq!(cert["ValidationMethod"], "DNS");

        assert_eq!(
            json["Outputs"]["ServiceUrl"]["Value"],
            "https://wordpress.example.com"
        );
    }

    #[test]
    fn test_task_definition_sizing_and_environment() {
        let json = template(&settings());
        let task = &json["Resources"]["WordpressServiceTaskDef"]["Properties"];

        assert_eq!(task["Cpu"], "512");
        assert_eq!(task["Memory"], "1024");
        let container = &task["ContainerDefinitions"][0];
        assert_eq!(container["Name"], "web");
        assert_eq!(container["PortMappings"][0]["ContainerPort"], 80);

        let env = container["Environment"].as_array().unwrap();
        assert!(env.contains(&json!({ "Name": "WORDPRESS_DB_USER", "Value": "root" })));
        assert!(env.contains(&json!({ "Name": "WORDPRESS_DB_NAME", "Value": "wordpress" })));
        assert!(env.contains(&json!({
            "Name": "WORDPRESS_DB_HOST",
            "Value": { "Fn::GetAtt": ["Database", "Endpoint.Address"] }
        })));
        assert_eq!(
            container["Secrets"][0],
            json!({ "Name": "WORDPRESS_DB_PASSWORD", "ValueFrom": { "Ref": "DBSecret" } })
        );
        assert_eq!(
            json["Resources"]["WordpressService"]["Properties"]["DesiredCount"],
            1
        );
    }

    #[test]
    fn test_log_group_retention_and_removal() {
        let json = template(&settings());
        let log_group = &json["Resources"]["LogGroup"];

        assert_eq!(log_group["Properties"]["LogGroupName"], "WordpressFargate");
        assert_eq!(log_group["Properties"]["RetentionInDays"], 7);
        assert_eq!(log_group["DeletionPolicy"], "Delete");
    }

    #[test]
    fn test_database_cluster() {
        let json = template(&settings());
        let db = &json["Resources"]["Database"];

        assert_eq!(db["Type"], "AWS::RDS::DBCluster");
        assert_eq!(db["Properties"]["DatabaseName"], "wordpress");
        assert_eq!(db["Properties"]["MasterUsername"], "root");
        assert_eq!(
            json["Resources"]["DatabaseInstance1"]["Properties"]["DBInstanceClass"],
            "db.t3.small"
        );
        assert_eq!(
            json["Resources"]["DBSecret"]["Properties"]["GenerateSecretString"]["ExcludePunctuation"],
            true
        );
    }

    #[test]
    fn test_build_project_carries_buildspec() {
        let json = template(&settings());
        let project = &json["Resources"]["Build"]["Properties"];

        assert_eq!(project["Environment"]["Image"], "aws/codebuild/standard:3.0");
        assert_eq!(project["Environment"]["PrivilegedMode"], true);

        let spec: Value =
            serde_json::from_str(project["Source"]["BuildSpec"].as_str().unwrap()).unwrap();
        assert_eq!(spec["artifacts"]["files"], json!(["imagedefinitions.json"]));

        let names: Vec<_> = project["Environment"]["EnvironmentVariables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["Name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["ACCOUNT_ID", "ECR_REPOSITORY_NAME", "ECR_REPOSITORY_URI"]
        );
    }

    #[test]
    fn test_pipeline_stages_follow_definition() {
        let json = template(&settings());
        let pipeline = &json["Resources"]["WordpressPipeline"]["Properties"];

        let stages: Vec<_> = pipeline["Stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["Name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(stages, vec!["Source", "Build", "Deploy"]);

        let deploy = &pipeline["Stages"][2]["Actions"][0];
        assert_eq!(deploy["ActionTypeId"]["Provider"], "ECS");
        assert_eq!(deploy["Configuration"]["FileName"], "imagedefinitions.json");
        assert_eq!(
            deploy["InputArtifacts"],
            json!([{ "Name": "fargateBuildOutput" }])
        );

        let build = &pipeline["Stages"][1]["Actions"][0];
        assert_eq!(build["Configuration"]["ProjectName"], json!({ "Ref": "Build" }));
    }

    #[test]
    fn test_pipeline_depends_on_build_project() {
        let json = template(&settings());
        let depends_on = json["Resources"]["WordpressPipeline"]["DependsOn"]
            .as_array()
            .unwrap();
        assert!(depends_on.contains(&json!("Build")));
        assert!(depends_on.contains(&json!("WordpressService")));
    }

    #[test]
    fn test_unknown_build_project_is_rejected() {
        let settings = settings();
        let mut pipeline = wordpress_pipeline(&settings).unwrap();
        pipeline.stages[1].actions[0].config = ActionConfig::Build {
            project: "Missing".to_string(),
        };
        let stack = PipelineStack::new(&settings, &pipeline, &BuildSpec::wordpress()).unwrap();

        let err = synthesize(stack.definition()).unwrap_err();
        assert!(matches!(err, SynthError::UndeclaredReference { reference, .. } if reference == "Missing"));
    }
}
