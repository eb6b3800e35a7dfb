//! Build specification for the build action.
//!
//! Commands are written once with `${...}` variables and rendered two ways:
//! as the document handed to the hosted build service, where the values come
//! from its shell environment, and as a script for the local executor, where
//! every value is already known.
//!
//! ```kdl
//! buildspec version="0.2" {
//!     working-directory "wordpress"
//!     pre-build {
//!         run "aws --version"
//!     }
//!     build {
//!         run "docker build -t ${image.repository_name}:${image.tag} ."
//!     }
//!     post-build {
//!         run "docker push ${image.repository_uri}:${image.tag}"
//!     }
//!     artifact "imagedefinitions.json"
//! }
//! ```

use crate::node::{first_string_arg, string_prop};
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde_json::{Value, json};
use wpstack_core::artifact::{IMAGE_DEFINITIONS_FILE, WEB_CONTAINER};
use wpstack_core::image::{FALLBACK_TAG, SHORT_TAG_LEN};

pub const BUILDSPEC_VERSION: &str = "0.2";

/// Directory inside the source tree holding the Dockerfile.
pub const DEFAULT_WORKING_DIRECTORY: &str = "wordpress";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub version: String,
    /// Directory the build phase runs in, relative to the source root.
    pub working_directory: Option<String>,
    pub pre_build: Vec<String>,
    pub build: Vec<String>,
    pub post_build: Vec<String>,
    /// Files collected as the build artifact, relative to the source root.
    pub artifacts: Vec<String>,
}

impl BuildSpec {
    /// Build, tag and push the WordPress image.
    pub fn wordpress() -> Self {
        Self {
            version: BUILDSPEC_VERSION.to_string(),
            working_directory: Some(DEFAULT_WORKING_DIRECTORY.to_string()),
            pre_build: vec![
                "echo Logging in to Amazon ECR...".to_string(),
                "aws --version".to_string(),
                "aws ecr get-login-password --region ${account.region} | docker login --username AWS --password-stdin ${account.id}.dkr.ecr.${account.region}.amazonaws.com".to_string(),
                "echo image tag: ${image.tag}".to_string(),
            ],
            build: vec![
                "echo Build started on `date`".to_string(),
                "docker build -t ${image.repository_name}:${image.tag} .".to_string(),
                "docker tag ${image.repository_name}:${image.tag} ${image.repository_uri}:${image.tag}".to_string(),
            ],
            post_build: vec![
                "echo Build completed on `date`".to_string(),
                "docker push ${image.repository_uri}:${image.tag}".to_string(),
            ],
            artifacts: vec![IMAGE_DEFINITIONS_FILE.to_string()],
        }
    }

    /// Check the spec is runnable: it builds something, collects the
    /// image-definitions file, and only uses variables the build knows.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.build.is_empty() {
            return Err(ConfigError::invalid(
                "buildspec.build",
                "at least one build command is required",
            ));
        }
        if !self.artifacts.iter().any(|f| f == IMAGE_DEFINITIONS_FILE) {
            return Err(ConfigError::invalid(
                "buildspec.artifacts",
                format!("must include {}", IMAGE_DEFINITIONS_FILE),
            ));
        }
        if let Some(dir) = &self.working_directory {
            if dir.is_empty() || dir.starts_with('/') || dir.split('/').any(|p| p == "..") {
                return Err(ConfigError::invalid(
                    "buildspec.working-directory",
                    format!("'{}' must be a relative path inside the source tree", dir),
                ));
            }
        }

        let ctx = VariableContext::hosted_build();
        for command in self.commands() {
            if let Some(name) = ctx.unresolved(command).into_iter().next() {
                return Err(ConfigError::InvalidReference(format!(
                    "unknown variable ${{{}}} in build command '{}'",
                    name, command
                )));
            }
        }
        Ok(())
    }

    /// Every command in phase order.
    pub fn commands(&self) -> impl Iterator<Item = &String> {
        self.pre_build
            .iter()
            .chain(self.build.iter())
            .chain(self.post_build.iter())
    }

    /// Render the document run by the hosted build service.
    ///
    /// The tag is derived in the build shell from the resolved source
    /// version, falling back to `latest` when that is empty, and the
    /// image-definitions file is written by the final command.
    pub fn render_hosted(&self) -> Value {
        let ctx = VariableContext::hosted_build();

        let mut pre_build = vec![
            format!(
                "COMMIT_HASH=$(echo $CODEBUILD_RESOLVED_SOURCE_VERSION | cut -c 1-{})",
                SHORT_TAG_LEN
            ),
            format!("IMAGE_TAG=${{COMMIT_HASH:={}}}", FALLBACK_TAG),
        ];
        pre_build.extend(ctx.interpolate_vec(&self.pre_build));

        let mut build = Vec::new();
        if let Some(dir) = &self.working_directory {
            build.push(format!("cd {}", dir));
        }
        build.extend(ctx.interpolate_vec(&self.build));

        let mut post_build = ctx.interpolate_vec(&self.post_build);
        post_build.push(format!(
            "printf '[{{\"name\":\"{}\",\"imageUri\":\"%s\"}}]' {}:{} > {}{}",
            WEB_CONTAINER,
            ctx.image.repository_uri,
            ctx.image.tag,
            self.source_root_prefix(),
            IMAGE_DEFINITIONS_FILE
        ));

        json!({
            "version": self.version,
            "phases": {
                "pre_build": { "commands": pre_build },
                "build": { "commands": build },
                "post_build": { "commands": post_build },
            },
            "artifacts": {
                "files": self.artifacts,
            },
        })
    }

    /// Render a shell script for the local executor. The caller writes the
    /// image-definitions artifact itself once the job succeeds.
    pub fn render_script(&self, ctx: &VariableContext) -> String {
        let mut lines = vec!["set -e".to_string()];
        lines.extend(ctx.interpolate_vec(&self.pre_build));
        if let Some(dir) = &self.working_directory {
            lines.push(format!("cd {}", dir));
        }
        lines.extend(ctx.interpolate_vec(&self.build));
        lines.extend(ctx.interpolate_vec(&self.post_build));
        lines.join("\n")
    }

    /// Relative path from the working directory back to the source root.
    fn source_root_prefix(&self) -> String {
        match &self.working_directory {
            Some(dir) => "../".repeat(dir.split('/').filter(|p| !p.is_empty()).count()),
            None => String::new(),
        }
    }
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self::wordpress()
    }
}

/// Parse a build specification from KDL text and validate it.
pub fn parse_buildspec(kdl: &str) -> ConfigResult<BuildSpec> {
    let doc: KdlDocument = kdl.parse()?;
    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "buildspec")
        .ok_or_else(|| ConfigError::MissingField("buildspec".to_string()))?;

    let mut spec = BuildSpec {
        version: string_prop(node, "version").unwrap_or_else(|| BUILDSPEC_VERSION.to_string()),
        working_directory: None,
        pre_build: Vec::new(),
        build: Vec::new(),
        post_build: Vec::new(),
        artifacts: Vec::new(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "working-directory" => spec.working_directory = first_string_arg(child),
                "pre-build" => spec.pre_build = parse_commands(child)?,
                "build" => spec.build = parse_commands(child)?,
                "post-build" => spec.post_build = parse_commands(child)?,
                "artifact" => {
                    let file = first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("artifact file".to_string()))?;
                    spec.artifacts.push(file);
                }
                _ => {}
            }
        }
    }

    spec.validate()?;
    Ok(spec)
}

fn parse_commands(node: &KdlNode) -> ConfigResult<Vec<String>> {
    let mut commands = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "run" {
                let command = first_string_arg(child).ok_or_else(|| {
                    ConfigError::MissingField(format!("{} run command", node.name().value()))
                })?;
                commands.push(command);
            }
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableContextBuilder;
    use wpstack_core::image::derive_image_tag;

    fn commands(doc: &Value, phase: &str) -> Vec<String> {
        doc["phases"][phase]["commands"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_wordpress_spec_is_valid() {
        BuildSpec::wordpress().validate().unwrap();
    }

    #[test]
    fn test_hosted_render_derives_tag_first() {
        let doc = BuildSpec::wordpress().render_hosted();
        let pre = commands(&doc, "pre_build");

        assert_eq!(doc["version"], "0.2");
        assert_eq!(
            pre[0],
            "COMMIT_HASH=$(echo $CODEBUILD_RESOLVED_SOURCE_VERSION | cut -c 1-7)"
        );
        assert_eq!(pre[1], "IMAGE_TAG=${COMMIT_HASH:=latest}");
        assert!(pre.iter().any(|c| c.contains(
            "docker login --username AWS --password-stdin $ACCOUNT_ID.dkr.ecr.$AWS_DEFAULT_REGION.amazonaws.com"
        )));
    }

    #[test]
    fn test_hosted_render_builds_in_working_directory() {
        let doc = BuildSpec::wordpress().render_hosted();
        let build = commands(&doc, "build");

        let cd = build.iter().position(|c| c == "cd wordpress").unwrap();
        let docker_build = build
            .iter()
            .position(|c| c == "docker build -t $ECR_REPOSITORY_NAME:$IMAGE_TAG .")
            .unwrap();
        assert!(cd < docker_build);
        assert!(build.contains(
            &"docker tag $ECR_REPOSITORY_NAME:$IMAGE_TAG $ECR_REPOSITORY_URI:$IMAGE_TAG".to_string()
        ));
    }

    #[test]
    fn test_hosted_render_writes_image_definitions() {
        let doc = BuildSpec::wordpress().render_hosted();
        let post = commands(&doc, "post_build");

        assert_eq!(
            post.last().unwrap(),
            r#"printf '[{"name":"web","imageUri":"%s"}]' $ECR_REPOSITORY_URI:$IMAGE_TAG > ../imagedefinitions.json"#
        );
        assert_eq!(doc["artifacts"]["files"], json!(["imagedefinitions.json"]));
    }

    #[test]
    fn test_hosted_render_without_working_directory() {
        let mut spec = BuildSpec::wordpress();
        spec.working_directory = None;
        let doc = spec.render_hosted();

        assert!(!commands(&doc, "build").iter().any(|c| c.starts_with("cd ")));
        assert!(
            commands(&doc, "post_build")
                .last()
                .unwrap()
                .ends_with("> imagedefinitions.json")
        );
    }

    #[test]
    fn test_script_render_uses_concrete_values() {
        let ctx = VariableContextBuilder::new()
            .with_image(
                &derive_image_tag(Some("0123456789abcdef")),
                "wordpress",
                "123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress",
            )
            .with_account("123456789012", "eu-west-1")
            .build();
        let script = BuildSpec::wordpress().render_script(&ctx);

        assert!(script.starts_with("set -e\n"));
        assert!(script.contains("docker build -t wordpress:0123456 ."));
        assert!(script.contains(
            "docker push 123456789012.dkr.ecr.eu-west-1.amazonaws.com/wordpress:0123456"
        ));
        assert!(!script.contains("${"));
        assert!(!script.contains("imagedefinitions"));
    }

    #[test]
    fn test_validate_rejects_unknown_variable() {
        let mut spec = BuildSpec::wordpress();
        spec.build.push("echo ${image.digest}".to_string());
        assert!(matches!(
            spec.validate(),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_validate_requires_image_definitions_artifact() {
        let mut spec = BuildSpec::wordpress();
        spec.artifacts = vec!["output.zip".to_string()];
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_escaping_working_directory() {
        let mut spec = BuildSpec::wordpress();
        spec.working_directory = Some("../outside".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_parse_buildspec() {
        let kdl = r#"
            buildspec version="0.2" {
                working-directory "app/wordpress"
                pre-build {
                    run "aws --version"
                }
                build {
                    run "docker build -t ${image.repository_name}:${image.tag} ."
                }
                post-build {
                    run "docker push ${image.repository_uri}:${image.tag}"
                }
                artifact "imagedefinitions.json"
            }
        "#;

        let spec = parse_buildspec(kdl).unwrap();
        assert_eq!(spec.working_directory.as_deref(), Some("app/wordpress"));
        assert_eq!(spec.pre_build, vec!["aws --version"]);
        assert_eq!(spec.build.len(), 1);

        let doc = spec.render_hosted();
        assert!(
            commands(&doc, "post_build")
                .last()
                .unwrap()
                .ends_with("> ../../imagedefinitions.json")
        );
    }

    #[test]
    fn test_parse_buildspec_requires_build_commands() {
        let kdl = r#"
            buildspec {
                artifact "imagedefinitions.json"
            }
        "#;
        assert!(parse_buildspec(kdl).is_err());
    }
}
