use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuNode {
    pub id: String,
    pub label: String,
    pub description: String,
    pub children: Vec<MenuNode>,
}

impl MenuNode {
    pub fn leaf(id: &str, label: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            children: Vec::new(),
        }
    }

    pub fn submenu(id: &str, label: &str, description: &str, children: Vec<MenuNode>) -> Self {
        Self {
            children,
            ..Self::leaf(id, label, description)
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Ids from the root's child down to the selected leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MenuPath(pub Vec<String>);

impl MenuPath {
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn join(&self) -> String {
        self.0.join("/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuOutcome {
    NoOp,
    Display {
        title: String,
        lines: Vec<String>,
        cwd_change: Option<PathBuf>,
    },
    /// Leave the program, optionally handing a directory to the parent shell.
    Exit { handoff: Option<PathBuf> },
}

/// Resolves a selected leaf to its action. Runs on a worker thread.
pub trait MenuDispatcher: Send + Sync {
    fn dispatch(&self, path: &MenuPath, working_directory: &Path) -> MenuOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuSelection {
    Opened,
    Leaf,
}

/// Position in the menu tree: the chain of opened submenus plus the highlighted row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MenuCursor {
    stack: Vec<usize>,
    selected: usize,
}

impl MenuCursor {
    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn current<'t>(&self, root: &'t MenuNode) -> &'t MenuNode {
        self.stack
            .iter()
            .fold(root, |node, index| node.children.get(*index).unwrap_or(node))
    }

    pub fn items<'t>(&self, root: &'t MenuNode) -> &'t [MenuNode] {
        &self.current(root).children
    }

    pub fn highlighted<'t>(&self, root: &'t MenuNode) -> Option<&'t MenuNode> {
        self.items(root).get(self.selected)
    }

    pub fn move_up(&mut self, root: &MenuNode) {
        let len = self.items(root).len();
        if len > 0 {
            self.selected = (self.selected + len - 1) % len;
        }
    }

    pub fn move_down(&mut self, root: &MenuNode) {
        let len = self.items(root).len();
        if len > 0 {
            self.selected = (self.selected + 1) % len;
        }
    }

    /// Opens the highlighted submenu, or reports that a leaf was chosen.
    pub fn select(&mut self, root: &MenuNode) -> Option<MenuSelection> {
        let node = self.highlighted(root)?;
        if node.is_leaf() {
            return Some(MenuSelection::Leaf);
        }
        self.stack.push(self.selected);
        self.selected = 0;
        Some(MenuSelection::Opened)
    }

    /// Returns to the parent menu with its previous row highlighted.
    pub fn back(&mut self) -> bool {
        match self.stack.pop() {
            Some(previous) => {
                self.selected = previous;
                true
            }
            None => false,
        }
    }

    pub fn path(&self, root: &MenuNode) -> MenuPath {
        let mut node = root;
        let mut ids = Vec::with_capacity(self.stack.len() + 1);
        for index in &self.stack {
            let Some(child) = node.children.get(*index) else {
                break;
            };
            ids.push(child.id.clone());
            node = child;
        }
        if let Some(leaf) = node.children.get(self.selected) {
            ids.push(leaf.id.clone());
        }
        MenuPath(ids)
    }

    pub fn breadcrumb<'t>(&self, root: &'t MenuNode) -> Vec<&'t str> {
        let mut node = root;
        let mut labels = vec![root.label.as_str()];
        for index in &self.stack {
            let Some(child) = node.children.get(*index) else {
                break;
            };
            labels.push(child.label.as_str());
            node = child;
        }
        labels
    }
}
