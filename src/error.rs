use thiserror::Error;

/// Placeholder written wherever a secret would otherwise appear.
pub const MASK: &str = "****";

#[derive(Error, Debug)]
pub enum StreamError {
    /// 配置字段缺失或非法，不会尝试启动
    #[error("invalid configuration: {message}")]
    Validation { message: String },

    /// 设备或视频文件不存在
    #[error("{message}")]
    Precondition { message: String },

    /// 操作系统层面的启动失败
    #[error("failed to launch {program}: {message}")]
    Spawn { program: String, message: String },

    /// 进程已启动但在宽限期内退出
    #[error("{program} exited during startup: {tail}")]
    StartupTimeout { program: String, tail: String },

    /// 中继服务未能进入 active 状态
    #[error("relay failure: {message}")]
    DependencyFailure { message: String, log_tail: String },
}

impl StreamError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition { message: message.into() }
    }

    pub fn spawn(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn dependency(message: impl Into<String>, log_tail: impl Into<String>) -> Self {
        Self::DependencyFailure {
            message: message.into(),
            log_tail: log_tail.into(),
        }
    }

    /// Machine-readable kind for the JSON envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Precondition { .. } => "precondition",
            Self::Spawn { .. } => "spawn",
            Self::StartupTimeout { .. } => "startup_timeout",
            Self::DependencyFailure { .. } => "dependency_failure",
        }
    }

    /// Scrubs `secrets` and any URL password from the carried text.
    ///
    /// Tool stderr is echoed back verbatim and may repeat an argument that
    /// carried a password (ffmpeg prints the output URL on failure).
    pub fn redact(self, secrets: &[String]) -> Self {
        let scrub = |s: String| scrub(&s, secrets);
        match self {
            Self::Validation { message } => Self::Validation { message: scrub(message) },
            Self::Precondition { message } => Self::Precondition { message: scrub(message) },
            Self::Spawn { program, message } => Self::Spawn {
                program,
                message: scrub(message),
            },
            Self::StartupTimeout { program, tail } => Self::StartupTimeout {
                program,
                tail: scrub(tail),
            },
            Self::DependencyFailure { message, log_tail } => Self::DependencyFailure {
                message: scrub(message),
                log_tail: scrub(log_tail),
            },
        }
    }
}

/// 把 `secrets` 和 URL 中 `user:pass@` 的密码部分替换为掩码
pub fn scrub(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret.as_str(), MASK);
    }
    mask_url_passwords(&out)
}

fn mask_url_passwords(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find("://") {
        let (head, tail) = rest.split_at(idx + 3);
        out.push_str(head);
        let end = tail
            .find(|c: char| c == '/' || c == '\'' || c == '"' || c.is_whitespace())
            .unwrap_or(tail.len());
        let authority = &tail[..end];
        match authority.rfind('@') {
            Some(at) => {
                let userinfo = &authority[..at];
                match userinfo.find(':') {
                    Some(colon) => {
                        out.push_str(&userinfo[..=colon]);
                        out.push_str(MASK);
                    }
                    None => out.push_str(userinfo),
                }
                out.push_str(&authority[at..]);
            }
            None => out.push_str(authority),
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

/// Non-fatal outcome of a termination request.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationWarning {
    pub pid: Option<u32>,
    pub message: String,
}

impl std::fmt::Display for TerminationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid {}: {}", pid, self.message),
            None => f.write_str(&self.message),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
