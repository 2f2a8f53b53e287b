use super::*;

const STACK_INLINE_DEPTH: usize = 32;

type FrameBuffer = SmallVec<[Frame; STACK_INLINE_DEPTH]>;

/// One stack frame in canonical printable form.
///
/// Two frame instances denoting the same source point compare equal, which
/// is what collapses them into one call-tree node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Frame {
  pub path: Arc<str>,
  pub label: Arc<str>,
  pub line: u32,
}

impl Frame {
  #[must_use]
  pub fn new(
    path: impl Into<String>,
    label: impl Into<String>,
    line: u32,
  ) -> Self {
    Self {
      path: Arc::<str>::from(path.into()),
      label: Arc::<str>::from(label.into()),
      line,
    }
  }

  /// Canonical `path:line:label` key for this frame.
  #[must_use]
  pub fn location_key(&self) -> String {
    format!("{}:{}:{}", self.path, self.line, self.label)
  }
}

impl Display for Frame {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.path, self.line, self.label)
  }
}

/// Source of allocation-site stacks.
///
/// Implementations return frames ordered outermost first and at most
/// `max_depth` of them. Called during a drain, never from the hook context,
/// but it must not call back into the profiler.
pub trait StackSource: Send + Sync {
  fn collect(&self, max_depth: usize) -> Vec<Frame>;
}

/// Native stack capture backed by the `backtrace` crate.
#[derive(Debug, Default)]
pub struct BacktraceSource {
  skip_frames: usize,
}

impl BacktraceSource {
  /// `skip_frames` drops that many innermost frames, hiding the profiler's
  /// own machinery above the hook boundary.
  #[must_use]
  pub fn new(skip_frames: usize) -> Self {
    Self { skip_frames }
  }
}

impl StackSource for BacktraceSource {
  fn collect(&self, max_depth: usize) -> Vec<Frame> {
    let mut frames = FrameBuffer::new();
    let mut remaining_skip = self.skip_frames;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if frames.len() >= max_depth {
        return false;
      }

      frames.push(extract_frame(frame));

      true
    });

    // The unwinder yields innermost frames first.
    let mut frames = frames.into_vec();
    frames.reverse();
    frames
  }
}

fn extract_frame(frame: &NativeFrame) -> Frame {
  let mut path = None;
  let mut label = None;
  let mut line = None;

  backtrace::resolve_frame(frame, |symbol| {
    if path.is_none() {
      path = symbol
        .filename()
        .and_then(path_to_string)
        .map(str::to_string);
    }

    if label.is_none() {
      label = symbol.name().map(|name| symbol_name_to_string(&name));
    }

    if line.is_none() {
      line = symbol.lineno();
    }
  });

  Frame::new(
    path.unwrap_or_else(|| "<native>".to_string()),
    label.unwrap_or_else(|| "<unknown>".to_string()),
    line.unwrap_or(0),
  )
}

fn path_to_string(path: &Path) -> Option<&str> {
  path
    .to_str()
    .or_else(|| path.file_name().and_then(OsStr::to_str))
}

fn symbol_name_to_string(name: &SymbolName<'_>) -> String {
  format!("{name}")
}
