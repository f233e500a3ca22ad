// Constants shared by the run context, the container adapter and the
// context projections. Grouped in nested modules by concern.

/// Identity used as the first component of every container and volume name.
pub const TOOL_NAME: &str = "act";

/// Actor reported in the `github` context when none is configured.
pub const DEFAULT_ACTOR: &str = "nektos/act";

/// Placeholder run id / run number for local execution.
pub const LOCAL_RUN_ID: &str = "1";

/// Length budget shared by all components of a generated container name.
pub const CONTAINER_NAME_BUDGET: usize = 30;

/// Paths inside the job container.
pub mod paths {
    /// Root of the per-job named volume.
    pub const GITHUB_ROOT: &str = "/github/";
    pub const WORKSPACE: &str = "/github/workspace";
    pub const HOME: &str = "/github/home";
    pub const EVENT_PATH: &str = "/github/workflow/event.json";
    /// Event payload, relative to `GITHUB_ROOT`.
    pub const EVENT_FILE: &str = "workflow/event.json";
    /// Marker written to flag the home directory as initialized, relative to `GITHUB_ROOT`.
    pub const HOME_MARKER: &str = "home/.act";
    pub const CERTS_CLIENT: &str = "/certs/client";
    pub const TOOLCACHE: &str = "/toolcache";
    pub const ACTIONS: &str = "/actions";
    pub const RUNNER_HOME: &str = "/home/runner";
    pub const DIND_IMAGE_CACHE: &str = "/var/lib/docker/overlay2";
    pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
}

/// Named volumes shared between jobs.
pub mod volumes {
    pub const TOOLCACHE: &str = "act-toolcache";
    pub const ACTIONS: &str = "act-actions";
    pub const RUNNER_HOME: &str = "act-runner-home";
    pub const DIND_IMAGE_CACHE: &str = "act-dind-imagecache";
    /// Suffix of the TLS certificate volume shared with the sidecar.
    pub const CERT_SUFFIX: &str = "-cert";
}

/// Container images and process settings.
pub mod containers {
    pub const DIND_IMAGE: &str = "docker:dind";
    pub const NETWORK_MODE: &str = "default";
    /// Keeps the job container alive so steps can be exec'ed into it.
    pub const JOB_ENTRYPOINT: &[&str] = &["/usr/bin/tail", "-f", "/dev/null"];
    /// Hostname aliases under which the sidecar is linked into the job container.
    pub const DIND_ALIASES: &[&str] = &["docker", "deps.localdev.boreas.cloud"];
    pub const FILE_MODE: u32 = 0o644;
}

/// Environment variable names and fixed values.
pub mod env {
    pub const RUNNER_TOOL_CACHE: (&str, &str) = ("RUNNER_TOOL_CACHE", "/opt/hostedtoolcache");
    pub const RUNNER_OS: (&str, &str) = ("RUNNER_OS", "Linux");
    pub const RUNNER_TEMP: (&str, &str) = ("RUNNER_TEMP", "/tmp");
    pub const DOCKER_TLS_VERIFY: (&str, &str) = ("DOCKER_TLS_VERIFY", "1");
    pub const DOCKER_CERT_PATH: (&str, &str) = ("DOCKER_CERT_PATH", "/certs/client");
    pub const DOCKER_HOST: (&str, &str) = ("DOCKER_HOST", "tcp://docker:2376");
    pub const DOCKER_TLS_CERTDIR: (&str, &str) = ("DOCKER_TLS_CERTDIR", "/certs");

    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
    pub const XDG_CACHE_HOME: &str = "XDG_CACHE_HOME";
    pub const HOME: &str = "HOME";
    pub const PATH: &str = "PATH";
}

/// Event names with special handling.
pub mod events {
    pub const PULL_REQUEST: &str = "pull_request";
    pub const PUSH: &str = "push";
}
