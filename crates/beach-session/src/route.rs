use parking_lot::Mutex;
use url::form_urlencoded;

/// Boundary to the application's router.
pub trait Navigator: Send + Sync {
    fn current_location(&self) -> String;
    fn navigate(&self, to: &str);
}

/// Which locations require a signed-in user and where to send users who lose
/// their session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub sign_in_path: String,
    pub return_param: String,
    pub protected_prefixes: Vec<String>,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            sign_in_path: "/login".to_string(),
            return_param: "next".to_string(),
            protected_prefixes: vec![
                "/dashboard".to_string(),
                "/admin".to_string(),
                "/settings".to_string(),
            ],
        }
    }
}

impl RoutePolicy {
    pub fn is_protected(&self, location: &str) -> bool {
        let path = path_of(location);
        if path == path_of(&self.sign_in_path) {
            return false;
        }
        self.protected_prefixes
            .iter()
            .any(|prefix| prefix_matches(prefix, path))
    }

    /// Sign-in entry point, optionally recording where the user came from.
    pub fn sign_in_location(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(origin) => {
                let encoded: String = form_urlencoded::byte_serialize(origin.as_bytes()).collect();
                format!("{}?{}={}", self.sign_in_path, self.return_param, encoded)
            }
            None => self.sign_in_path.clone(),
        }
    }
}

fn path_of(location: &str) -> &str {
    let end = location.find(['?', '#']).unwrap_or(location.len());
    &location[..end]
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Navigator that only records where it has been sent.
#[derive(Debug)]
pub struct MemoryNavigator {
    state: Mutex<NavigatorState>,
}

#[derive(Debug)]
struct NavigatorState {
    location: String,
    history: Vec<String>,
}

impl MemoryNavigator {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(NavigatorState {
                location: location.into(),
                history: Vec::new(),
            }),
        }
    }

    /// Moves without counting as a navigation issued by the session layer.
    pub fn set_location(&self, location: impl Into<String>) {
        self.state.lock().location = location.into();
    }

    /// Navigations issued through [`Navigator::navigate`], oldest first.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_location(&self) -> String {
        self.state.lock().location.clone()
    }

    fn navigate(&self, to: &str) {
        let mut state = self.state.lock();
        state.location = to.to_string();
        state.history.push(to.to_string());
    }
}
