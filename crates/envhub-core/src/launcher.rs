//! Starts one-shot repo2docker builder containers.

use std::collections::HashMap;

use tracing::info;
use uuid::Uuid;

use crate::docker::RegistryClient;
use crate::docker::labels;
use crate::error::CoreError;
use crate::validate::BuildSpec;

pub const DEFAULT_BUILDER_IMAGE: &str = "quay.io/jupyterhub/repo2docker:main";
pub const BUILDER_USER_NAME: &str = "jovyan";
pub const BUILDER_USER_ID: &str = "1100";
const DOCKER_SOCKET_BIND: &str = "/var/run/docker.sock:/var/run/docker.sock";

/// Refs at least this long are treated as full commit SHAs.
const FULL_SHA_LEN: usize = 40;
const SHORT_SHA_LEN: usize = 7;

/// Empty refs mean `HEAD`.
pub fn normalize_ref(git_ref: &str) -> &str {
    if git_ref.is_empty() { "HEAD" } else { git_ref }
}

/// Tag used in the image name; full SHAs are shortened.
pub fn image_tag(git_ref: &str) -> String {
    let git_ref = normalize_ref(git_ref);
    if git_ref.chars().count() >= FULL_SHA_LEN {
        git_ref.chars().take(SHORT_SHA_LEN).collect()
    } else {
        git_ref.to_owned()
    }
}

/// Image slug from a repository URL: `https://github.com/Org/Proj/` -> `org-proj`.
pub fn derive_name(repo: &str) -> String {
    let path = match reqwest::Url::parse(repo) {
        Ok(url) => url.path().to_owned(),
        Err(_) => repo.to_owned(),
    };
    path.trim_matches('/').to_lowercase().replace('/', "-")
}

pub fn builder_container_name(uid: Uuid) -> String {
    format!("envhub-build-{}", uid.simple())
}

/// Everything needed to start a builder container, computed up front.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub container_name: String,
    pub builder_image: String,
    pub image_name: String,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
}

impl LaunchPlan {
    pub fn new(
        uid: Uuid,
        spec: &BuildSpec,
        builder_image: &str,
        extra_build_args: &[String],
    ) -> Result<Self, CoreError> {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| derive_name(&spec.repo))
            .to_lowercase()
            .replace('/', "-");
        let checkout_ref = spec.checkout_ref().to_owned();
        let image_name = format!("{}:{}", name, image_tag(&spec.git_ref));
        let mem_limit = spec.mem_limit();
        let cpu_limit = spec.cpu_limit();
        let node_selector = if spec.node_selector.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&spec.node_selector).map_err(CoreError::launch)?)
        };

        let mut image_labels = vec![
            (labels::DISPLAY_NAME, name.as_str()),
            (labels::IMAGE_NAME, image_name.as_str()),
            (labels::MEM_LIMIT, mem_limit.as_str()),
            (labels::CPU_LIMIT, cpu_limit.as_str()),
        ];
        if let Some(selector) = &node_selector {
            image_labels.push((labels::NODE_SELECTOR, selector.as_str()));
        }

        let mut cmd: Vec<String> = vec![
            "jupyter-repo2docker".into(),
            "--ref".into(),
            checkout_ref.clone(),
            "--user-name".into(),
            BUILDER_USER_NAME.into(),
            "--user-id".into(),
            BUILDER_USER_ID.into(),
            "--no-run".into(),
            "--image-name".into(),
            image_name.clone(),
        ];
        for (key, value) in image_labels {
            cmd.push("--label".into());
            cmd.push(format!("{key}={value}"));
        }
        for arg in extra_build_args {
            cmd.push("--build-arg".into());
            cmd.push(arg.clone());
        }
        cmd.push(spec.repo.clone());

        let mut labels = HashMap::from([
            (labels::REPO.to_owned(), spec.repo.clone()),
            (labels::REF.to_owned(), checkout_ref),
            (labels::BUILD.to_owned(), image_name.clone()),
            (labels::DISPLAY_NAME.to_owned(), name),
            (labels::MEM_LIMIT.to_owned(), mem_limit),
            (labels::CPU_LIMIT.to_owned(), cpu_limit),
        ]);
        if let Some(selector) = node_selector {
            labels.insert(labels::NODE_SELECTOR.to_owned(), selector);
        }

        let env = spec
            .credentials
            .iter()
            .map(|c| format!("GIT_CREDENTIAL_ENV={}", c.to_env_value()))
            .collect();

        Ok(Self {
            container_name: builder_container_name(uid),
            builder_image: builder_image.to_owned(),
            image_name,
            cmd,
            labels,
            env,
            binds: vec![DOCKER_SOCKET_BIND.to_owned()],
        })
    }
}

/// Launches builds as containers of a fixed builder image.
#[derive(Debug, Clone)]
pub struct BuildLauncher {
    registry: RegistryClient,
    builder_image: String,
    extra_build_args: Vec<String>,
}

impl BuildLauncher {
    pub fn new(registry: RegistryClient, builder_image: impl Into<String>, extra_build_args: Vec<String>) -> Self {
        Self {
            registry,
            builder_image: builder_image.into(),
            extra_build_args,
        }
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn plan(&self, uid: Uuid, spec: &BuildSpec) -> Result<LaunchPlan, CoreError> {
        LaunchPlan::new(uid, spec, &self.builder_image, &self.extra_build_args)
    }

    /// Create and start the builder container. Any failure is a launch failure.
    pub async fn launch(&self, uid: Uuid, spec: &BuildSpec) -> Result<LaunchPlan, CoreError> {
        let plan = self.plan(uid, spec)?;
        self.registry
            .run_container(&plan)
            .await
            .map_err(CoreError::launch)?;
        info!(
            %uid,
            container = %plan.container_name,
            image = %plan.image_name,
            "builder container started"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::GitCredentials;
    use crate::validate::BuildForm;

    fn spec(form: BuildForm) -> BuildSpec {
        form.validate(false).unwrap()
    }

    fn base() -> BuildForm {
        BuildForm {
            repo: "https://github.com/org/proj".into(),
            git_ref: "main".into(),
            ..Default::default()
        }
    }

    fn arg_after<'a>(cmd: &'a [String], flag: &str) -> &'a str {
        let pos = cmd.iter().position(|a| a == flag).unwrap();
        &cmd[pos + 1]
    }

    #[test]
    fn refs_are_normalized() {
        assert_eq!(normalize_ref(""), "HEAD");
        assert_eq!(image_tag(""), "HEAD");
        assert_eq!(image_tag("main"), "main");
        let sha = "a".repeat(40);
        assert_eq!(image_tag(&sha), "aaaaaaa");
        assert_eq!(image_tag(&"b".repeat(39)), "b".repeat(39));
    }

    #[test]
    fn names_come_from_the_url_path() {
        assert_eq!(derive_name("https://github.com/Org/Proj/"), "org-proj");
        assert_eq!(derive_name("https://gitlab.com/a/b/c"), "a-b-c");
        assert_eq!(derive_name("org/proj"), "org-proj");
    }

    #[test]
    fn long_ref_is_truncated_in_tag_but_not_in_checkout() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let plan = LaunchPlan::new(
            Uuid::nil(),
            &spec(BuildForm {
                git_ref: sha.into(),
                ..base()
            }),
            DEFAULT_BUILDER_IMAGE,
            &[],
        )
        .unwrap();
        assert_eq!(plan.image_name, "org-proj:0123456");
        assert_eq!(arg_after(&plan.cmd, "--ref"), sha);
        assert_eq!(arg_after(&plan.cmd, "--image-name"), "org-proj:0123456");
        assert_eq!(plan.labels[labels::REF], sha);
        assert_eq!(plan.labels[labels::BUILD], "org-proj:0123456");
    }

    #[test]
    fn command_carries_identity_labels_and_build_args() {
        let plan = LaunchPlan::new(
            Uuid::nil(),
            &spec(BuildForm {
                name: "proj".into(),
                memory: Some("2".into()),
                cpu: Some("1.5".into()),
                ..base()
            }),
            "repo2docker:test",
            &["HTTP_PROXY=http://proxy:3128".to_owned()],
        )
        .unwrap();
        assert_eq!(plan.builder_image, "repo2docker:test");
        assert_eq!(plan.cmd.first().unwrap(), "jupyter-repo2docker");
        assert_eq!(plan.cmd.last().unwrap(), "https://github.com/org/proj");
        assert_eq!(arg_after(&plan.cmd, "--user-name"), BUILDER_USER_NAME);
        assert_eq!(arg_after(&plan.cmd, "--user-id"), BUILDER_USER_ID);
        assert!(plan.cmd.contains(&"--no-run".to_owned()));
        assert_eq!(arg_after(&plan.cmd, "--build-arg"), "HTTP_PROXY=http://proxy:3128");
        assert!(plan.cmd.contains(&"tljh_repo2docker.mem_limit=2G".to_owned()));
        assert!(plan.cmd.contains(&"tljh_repo2docker.cpu_limit=1.5".to_owned()));
        assert!(plan.cmd.contains(&"tljh_repo2docker.image_name=proj:main".to_owned()));
        assert_eq!(plan.labels[labels::DISPLAY_NAME], "proj");
        assert_eq!(plan.labels[labels::MEM_LIMIT], "2G");
        assert!(!plan.labels.contains_key(labels::NODE_SELECTOR));
        assert!(plan.env.is_empty());
        assert_eq!(plan.binds, vec![DOCKER_SOCKET_BIND.to_owned()]);
        assert_eq!(plan.container_name, format!("envhub-build-{}", Uuid::nil().simple()));
    }

    #[test]
    fn node_selector_is_labelled_as_json() {
        let plan = LaunchPlan::new(
            Uuid::nil(),
            &spec(BuildForm {
                node_selector: [("disktype".to_owned(), "ssd".to_owned())].into(),
                ..base()
            }),
            DEFAULT_BUILDER_IMAGE,
            &[],
        )
        .unwrap();
        assert_eq!(plan.labels[labels::NODE_SELECTOR], r#"{"disktype":"ssd"}"#);
        assert!(plan
            .cmd
            .contains(&r#"tljh_repo2docker.node_selector={"disktype":"ssd"}"#.to_owned()));
    }

    #[test]
    fn credentials_become_env() {
        let plan = LaunchPlan::new(
            Uuid::nil(),
            &spec(BuildForm {
                credentials: GitCredentials::from_parts(Some("bot".into()), Some("s3cret".into())),
                ..base()
            }),
            DEFAULT_BUILDER_IMAGE,
            &[],
        )
        .unwrap();
        assert_eq!(plan.env, vec!["GIT_CREDENTIAL_ENV=username=bot\npassword=s3cret".to_owned()]);
    }
}
