use std::borrow::Cow;

/// The operating system that produced the snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Os {
    Windows,
    MacOs,
    Ios,
    Linux,
    Solaris,
    Android,
    Unknown,
}

impl Os {
    pub fn name(self) -> &'static str {
        match self {
            Os::Windows => "windows",
            Os::MacOs => "macos",
            Os::Ios => "ios",
            Os::Linux => "linux",
            Os::Solaris => "solaris",
            Os::Android => "android",
            Os::Unknown => "unknown",
        }
    }
}

/// The CPU architecture that produced the snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cpu {
    X86,
    Amd64,
    Arm,
    Arm64,
    Ppc,
    Sparc,
    Mips,
    Unknown,
}

impl Cpu {
    pub fn name(self) -> &'static str {
        match self {
            Cpu::X86 => "x86",
            Cpu::Amd64 => "amd64",
            Cpu::Arm => "arm",
            Cpu::Arm64 => "arm64",
            Cpu::Ppc => "ppc",
            Cpu::Sparc => "sparc",
            Cpu::Mips => "mips",
            Cpu::Unknown => "unknown",
        }
    }
}

/// Information about the system that produced the snapshot.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// The operating system that produced the snapshot.
    pub os: Os,
    /// A string identifying the version of the operating system.
    ///
    /// This may look like "5.1.2600" or "10.4.8", if present.
    pub os_version: Option<String>,
    /// A string identifying the exact build of the operating system.
    ///
    /// This may look like "Service Pack 2" or "8L2127", if present.
    pub os_build: Option<String>,
    /// The CPU on which the snapshot was produced.
    pub cpu: Cpu,
    /// A string further identifying the specific CPU.
    ///
    /// For example, "GenuineIntel level 6 model 13 stepping 8", if present.
    pub cpu_info: Option<String>,
    /// The number of processors in the system.
    pub cpu_count: usize,
}

impl SystemInfo {
    /// Returns the full available operating system version.
    ///
    /// Returns the version and the build, if available, otherwise just the
    /// version.
    pub fn format_os_version(&self) -> Option<Cow<'_, str>> {
        match (&self.os_version, &self.os_build) {
            (Some(v), Some(b)) => Some(format!("{} {}", v, b).into()),
            (Some(v), None) => Some(Cow::Borrowed(v)),
            (None, Some(b)) => Some(Cow::Borrowed(b)),
            (None, None) => None,
        }
    }
}
