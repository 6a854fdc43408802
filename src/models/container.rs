use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use super::media_item::ContainerId;

/// Container categories, in display rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContainerKind {
    /// System-defined groupings such as the camera roll.
    System,
    /// Folders the user created.
    User,
    /// Folders written by applications (downloads, messengers).
    Application,
    Other,
}

impl ContainerKind {
    pub fn rank(self) -> u8 {
        match self {
            Self::System => 0,
            Self::User => 1,
            Self::Application => 2,
            Self::Other => 3,
        }
    }
}

/// One row of the grouped container query.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRow {
    pub id: ContainerId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub kind: ContainerKind,
    /// Ordering hint within a kind (lower first).
    pub priority: i32,
    /// Number of media items in the container at query time.
    pub count: usize,
}

impl ContainerRow {
    pub fn new(id: ContainerId, name: impl Into<String>, kind: ContainerKind) -> Self {
        Self {
            id,
            name: name.into(),
            path: None,
            kind,
            priority: 0,
            count: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A materialized grouping container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub kind: ContainerKind,
    pub priority: i32,
}

impl Container {
    pub fn from_row(row: &ContainerRow) -> Arc<Self> {
        Arc::new(Self {
            id: row.id,
            name: row.name.clone(),
            path: row.path.clone(),
            kind: row.kind,
            priority: row.priority,
        })
    }

    /// Orders containers by (kind rank, priority, name), ties broken by id.
    pub fn display_order(a: &Self, b: &Self) -> Ordering {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_order() {
        let camera = Container::from_row(&ContainerRow::new(3, "Camera", ContainerKind::System));
        let shots = Container::from_row(
            &ContainerRow::new(4, "Screenshots", ContainerKind::System).with_priority(1),
        );
        let alpha = Container::from_row(&ContainerRow::new(2, "alpha", ContainerKind::User));
        let beta = Container::from_row(&ContainerRow::new(1, "Beta", ContainerKind::User));
        let dl = Container::from_row(&ContainerRow::new(0, "Download", ContainerKind::Application));

        let mut list = vec![dl.clone(), beta.clone(), shots.clone(), alpha.clone(), camera.clone()];
        list.sort_by(|a, b| Container::display_order(a, b));

        let names: Vec<_> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Camera", "Screenshots", "alpha", "Beta", "Download"]);
    }
}
