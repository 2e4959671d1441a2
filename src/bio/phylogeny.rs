//! Newick trees and per-node abundance balances.

use crate::otu_table::OtuTable;
use indexmap::IndexMap;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhyloError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed Newick tree: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub name: Option<String>,
    pub length: Option<f64>,
    pub children: Vec<usize>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A rooted tree. Nodes are stored in preorder, so the root is `nodes[0]`
/// and every child has a larger index than its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyloTree {
    pub nodes: Vec<Node>,
}

impl PhyloTree {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PhyloError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| PhyloError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse_newick(&text)
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// Display label of node `index`: its name, or `node<index>` when unnamed.
    pub fn label(&self, index: usize) -> String {
        match &self.nodes[index].name {
            Some(name) => name.clone(),
            None => format!("node{}", index),
        }
    }
}

struct NewickParser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    nodes: Vec<Node>,
    open: Vec<usize>,
    /// Most recently completed node; labels and lengths attach to it.
    current: Option<usize>,
    /// Set after `(` or `,` until a node shows up in that slot.
    expecting_node: bool,
}

impl<'a> NewickParser<'a> {
    fn new(text: &'a str) -> Self {
        NewickParser {
            chars: text.char_indices().peekable(),
            nodes: Vec::new(),
            open: Vec::new(),
            current: None,
            expecting_node: false,
        }
    }

    fn add_node(&mut self) -> Result<usize, PhyloError> {
        let id = self.nodes.len();
        match self.open.last() {
            Some(&parent) => self.nodes[parent].children.push(id),
            None if self.nodes.is_empty() => {}
            None => {
                return Err(PhyloError::Malformed(
                    "more than one root node".to_string(),
                ))
            }
        }
        self.nodes.push(Node::default());
        Ok(id)
    }

    /// Node a label or branch length belongs to, creating a leaf if needed.
    fn target_node(&mut self) -> Result<usize, PhyloError> {
        match self.current {
            Some(id) => Ok(id),
            None => {
                let id = self.add_node()?;
                self.current = Some(id);
                self.expecting_node = false;
                Ok(id)
            }
        }
    }

    fn close_slot(&mut self) -> Result<(), PhyloError> {
        if self.expecting_node {
            self.add_node()?;
            self.expecting_node = false;
        }
        Ok(())
    }

    fn read_quoted(&mut self) -> Result<String, PhyloError> {
        let mut label = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if matches!(self.chars.peek(), Some((_, '\''))) {
                        self.chars.next();
                        label.push('\'');
                    } else {
                        return Ok(label);
                    }
                }
                Some((_, c)) => label.push(c),
                None => return Err(PhyloError::Malformed("unterminated quoted label".to_string())),
            }
        }
    }

    fn read_token(&mut self, first: char) -> String {
        let mut token = String::from(first);
        while let Some(&(_, c)) = self.chars.peek() {
            if matches!(c, '(' | ')' | ',' | ':' | ';' | '[' | '\'') || c.is_whitespace() {
                break;
            }
            token.push(c);
            self.chars.next();
        }
        token
    }

    fn skip_comment(&mut self) -> Result<(), PhyloError> {
        for (_, c) in self.chars.by_ref() {
            if c == ']' {
                return Ok(());
            }
        }
        Err(PhyloError::Malformed("unterminated comment".to_string()))
    }

    fn set_name(&mut self, name: String) -> Result<(), PhyloError> {
        let id = self.target_node()?;
        if self.nodes[id].name.is_some() {
            return Err(PhyloError::Malformed(format!("node {} has two labels", id)));
        }
        self.nodes[id].name = Some(name);
        Ok(())
    }

    fn parse(mut self) -> Result<PhyloTree, PhyloError> {
        while let Some((pos, c)) = self.chars.next() {
            match c {
                '(' => {
                    if self.current.is_some() {
                        return Err(PhyloError::Malformed(format!("unexpected '(' at {}", pos)));
                    }
                    let id = self.add_node()?;
                    self.open.push(id);
                    self.expecting_node = true;
                }
                ',' => {
                    if self.open.is_empty() {
                        return Err(PhyloError::Malformed(format!("',' outside parentheses at {}", pos)));
                    }
                    self.close_slot()?;
                    self.current = None;
                    self.expecting_node = true;
                }
                ')' => {
                    self.close_slot()?;
                    let id = self
                        .open
                        .pop()
                        .ok_or_else(|| PhyloError::Malformed(format!("unbalanced ')' at {}", pos)))?;
                    self.current = Some(id);
                }
                ':' => {
                    while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
                        self.chars.next();
                    }
                    let Some((_, first)) = self.chars.next() else {
                        return Err(PhyloError::Malformed("missing branch length".to_string()));
                    };
                    let token = self.read_token(first);
                    let length = token.parse::<f64>().map_err(|_| {
                        PhyloError::Malformed(format!("invalid branch length '{}' at {}", token, pos))
                    })?;
                    let id = self.target_node()?;
                    self.nodes[id].length = Some(length);
                }
                ';' => break,
                '[' => self.skip_comment()?,
                '\'' => {
                    let label = self.read_quoted()?;
                    self.set_name(label)?;
                }
                c if c.is_whitespace() => {}
                c => {
                    let token = self.read_token(c);
                    self.set_name(token)?;
                }
            }
        }

        if !self.open.is_empty() {
            return Err(PhyloError::Malformed(format!(
                "{} unclosed parentheses",
                self.open.len()
            )));
        }
        if self.nodes.is_empty() {
            return Err(PhyloError::Malformed("empty tree".to_string()));
        }
        Ok(PhyloTree { nodes: self.nodes })
    }
}

/// Parses a Newick tree.
///
/// Labels are kept verbatim so they can be matched against OTU ids. Comments
/// in brackets are skipped. Nesting depth is not limited by the call stack.
pub fn parse_newick(text: &str) -> Result<PhyloTree, PhyloError> {
    NewickParser::new(text).parse()
}

/// Balance of every internal node, per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceTable {
    pub sample_ids: Vec<String>,
    /// Node label to one balance per sample, in preorder.
    pub balances: IndexMap<String, Vec<f64>>,
}

/// Computes `L - R` for each internal node with at least two children.
///
/// Abundances are per-sample proportions of the OTU table; a leaf takes the
/// abundance of the OTU with its name (zero when the table lacks it). `L` is
/// the first child's subtree abundance and `R` the sum over the remaining
/// children.
pub fn lminusr_balances(tree: &PhyloTree, table: &OtuTable) -> BalanceTable {
    let n_samples = table.sample_ids().len();
    for (sample, sum) in table.sample_ids().iter().zip(table.column_sums()) {
        if sum == 0 {
            warn!("Sample {} has no reads; its balances are all zero", sample);
        }
    }
    let proportions = table.proportions();
    let row_of: std::collections::HashMap<&str, usize> = table
        .otu_ids()
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut subtree = vec![vec![0.0; n_samples]; tree.nodes.len()];
    let mut matched = 0;
    for index in (0..tree.nodes.len()).rev() {
        let node = &tree.nodes[index];
        if node.is_leaf() {
            let row = node.name.as_deref().and_then(|name| row_of.get(name));
            if let Some(&row) = row {
                matched += 1;
                subtree[index] = proportions.row(row).to_vec();
            }
        } else {
            let mut sums = vec![0.0; n_samples];
            for &child in &node.children {
                for (acc, v) in sums.iter_mut().zip(&subtree[child]) {
                    *acc += v;
                }
            }
            subtree[index] = sums;
        }
    }
    debug!(
        "{} of {} tree leaves matched OTUs",
        matched,
        tree.leaves().count()
    );

    let mut balances = IndexMap::new();
    for (index, node) in tree.nodes.iter().enumerate() {
        if node.children.len() < 2 {
            continue;
        }
        let left = &subtree[node.children[0]];
        let mut values = left.clone();
        for &child in &node.children[1..] {
            for (v, r) in values.iter_mut().zip(&subtree[child]) {
                *v -= r;
            }
        }
        let mut label = tree.label(index);
        if balances.contains_key(&label) {
            label = format!("node{}", index);
        }
        balances.insert(label, values);
    }

    BalanceTable {
        sample_ids: table.sample_ids().to_vec(),
        balances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_parse_simple_tree() {
        let tree = parse_newick("((A:0.1,B:0.2)inner:0.3,'C d');").unwrap();
        assert_eq!(tree.nodes.len(), 5);
        assert_eq!(tree.nodes[0].children, vec![1, 4]);
        assert_eq!(tree.nodes[1].name.as_deref(), Some("inner"));
        assert_eq!(tree.nodes[1].length, Some(0.3));
        assert_eq!(tree.nodes[2].name.as_deref(), Some("A"));
        assert_eq!(tree.nodes[3].length, Some(0.2));
        assert_eq!(tree.nodes[4].name.as_deref(), Some("C d"));
        assert_eq!(tree.label(0), "node0");
    }

    #[test]
    fn test_parse_unnamed_leaves_and_comments() {
        let tree = parse_newick("(,[comment](A,B));").unwrap();
        assert_eq!(tree.leaves().count(), 3);
        assert!(tree.nodes[1].name.is_none());
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        let depth = 50_000;
        let text = format!("{}A{};", "(".repeat(depth), ")".repeat(depth));
        let tree = parse_newick(&text).unwrap();
        assert_eq!(tree.nodes.len(), depth + 1);
    }

    #[test]
    fn test_malformed_trees() {
        assert!(matches!(parse_newick("((A,B);"), Err(PhyloError::Malformed(_))));
        assert!(matches!(parse_newick("(A,B));"), Err(PhyloError::Malformed(_))));
        assert!(matches!(parse_newick("   ;"), Err(PhyloError::Malformed(_))));
        assert!(matches!(parse_newick("(A:x,B);"), Err(PhyloError::Malformed(_))));
    }

    #[test]
    fn test_lminusr_balances() {
        let tree = parse_newick("((o1,o2)n1,o3,o9);").unwrap();
        let table = OtuTable::new(
            vec!["o1".into(), "o2".into(), "o3".into()],
            vec!["S1".into(), "S2".into()],
            arr2(&[[2, 0], [1, 0], [1, 0]]),
        )
        .unwrap();

        let balances = lminusr_balances(&tree, &table);
        let labels: Vec<&String> = balances.balances.keys().collect();
        assert_eq!(labels, vec!["node0", "n1"]);

        let root = &balances.balances["node0"];
        assert_relative_eq!(root[0], 0.75 - 0.25);
        assert_relative_eq!(root[1], 0.0);
        let n1 = &balances.balances["n1"];
        assert_relative_eq!(n1[0], 0.5 - 0.25);
    }
}
