//! Minimal Abaqus-style mesh description.
//!
//! Writes nodes, C3D8 element blocks keyed by material id (`ELSET=SET<id>`)
//! and named node/element sets, and parses the same subset back. Lines
//! starting with `**` are comments.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use tracing::debug;

use super::geometry::Mesh;
use super::topology::Hex8Element;
use crate::error::{HfeError, HfeResult};

/// Ids written per line in set blocks
const IDS_PER_LINE: usize = 16;

pub(crate) fn write_id_block<W: Write>(w: &mut W, ids: &[usize]) -> std::io::Result<()> {
    for chunk in ids.chunks(IDS_PER_LINE) {
        let line: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
        writeln!(w, "{}", line.join(", "))?;
    }
    Ok(())
}

/// Serialize a mesh.
pub fn write_mesh<W: Write>(w: &mut W, mesh: &Mesh) -> HfeResult<()> {
    writeln!(w, "*HEADING")?;
    writeln!(w, "** hexahedral mesh: {} nodes, {} elements", mesh.num_nodes(), mesh.num_elements())?;
    writeln!(w, "*NODE")?;
    for (idx, p) in mesh.geometry.nodes.iter().enumerate() {
        writeln!(w, "{:>12}, {}, {}, {}", idx + 1, p.x, p.y, p.z)?;
    }

    let mut by_material: BTreeMap<u32, Vec<&Hex8Element>> = BTreeMap::new();
    for elem in &mesh.connectivity.hex8_elements {
        by_material.entry(elem.material_id).or_default().push(elem);
    }
    for (material, elements) in &by_material {
        writeln!(w, "*ELEMENT, TYPE=C3D8, ELSET=SET{material}")?;
        for elem in elements {
            let nodes: Vec<String> = elem.nodes.iter().map(|n| n.to_string()).collect();
            writeln!(w, "{}, {}", elem.id, nodes.join(", "))?;
        }
    }

    for (name, ids) in &mesh.geometry.node_sets {
        writeln!(w, "*NSET, NSET={name}")?;
        write_id_block(w, ids)?;
    }
    for (name, ids) in &mesh.connectivity.element_sets {
        if name.starts_with("SET") && by_material.keys().any(|m| *name == format!("SET{m}")) {
            continue;
        }
        writeln!(w, "*ELSET, ELSET={name}")?;
        write_id_block(w, ids)?;
    }
    Ok(())
}

enum Block {
    None,
    Node,
    Element { elset: String, material: u32 },
    NodeSet(String),
    ElementSet(String),
}

/// Keyword and upper-cased `KEY=value` parameters of a keyword line
fn parse_keyword(line: &str) -> (String, BTreeMap<String, String>) {
    let mut parts = line.split(',');
    let keyword = parts
        .next()
        .unwrap_or_default()
        .trim()
        .to_uppercase();
    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            Some((k.trim().to_uppercase(), v.trim().to_string()))
        })
        .collect();
    (keyword, params)
}

fn parse_fields<T: std::str::FromStr>(line: &str, line_no: usize) -> HfeResult<Vec<T>> {
    line.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<T>().map_err(|_| HfeError::DeckParse {
                line: line_no,
                message: format!("cannot parse '{t}'"),
            })
        })
        .collect()
}

/// Material id encoded in an element set name (`SET<id>`), default 1.
fn material_from_elset(elset: &str) -> u32 {
    elset
        .strip_prefix("SET")
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

/// Parse a mesh description.
pub fn read_mesh<R: BufRead>(r: R) -> HfeResult<Mesh> {
    let mut mesh = Mesh::new();
    let mut block = Block::None;

    for (n, line) in r.lines().enumerate() {
        let line = line?;
        let line_no = n + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("**") {
            continue;
        }

        if trimmed.starts_with('*') {
            let (keyword, params) = parse_keyword(trimmed);
            block = match keyword.as_str() {
                "*NODE" => Block::Node,
                "*ELEMENT" => {
                    let kind = params.get("TYPE").map(|t| t.to_uppercase());
                    if kind.as_deref() != Some("C3D8") {
                        return Err(HfeError::DeckParse {
                            line: line_no,
                            message: format!("unsupported element type {kind:?}"),
                        });
                    }
                    let elset = params
                        .get("ELSET")
                        .cloned()
                        .unwrap_or_else(|| "SET1".to_string());
                    let material = material_from_elset(&elset);
                    Block::Element { elset, material }
                }
                "*NSET" => match params.get("NSET") {
                    Some(name) => Block::NodeSet(name.clone()),
                    None => {
                        return Err(HfeError::DeckParse {
                            line: line_no,
                            message: "*NSET without NSET=".to_string(),
                        })
                    }
                },
                "*ELSET" => match params.get("ELSET") {
                    Some(name) => Block::ElementSet(name.clone()),
                    None => {
                        return Err(HfeError::DeckParse {
                            line: line_no,
                            message: "*ELSET without ELSET=".to_string(),
                        })
                    }
                },
                _ => Block::None,
            };
            continue;
        }

        match &block {
            Block::None => {}
            Block::Node => {
                let fields: Vec<f64> = parse_fields(trimmed, line_no)?;
                if fields.len() < 4 {
                    return Err(HfeError::DeckParse {
                        line: line_no,
                        message: "node line needs id and three coordinates".to_string(),
                    });
                }
                let id = fields[0] as usize;
                if id != mesh.num_nodes() + 1 {
                    return Err(HfeError::DeckParse {
                        line: line_no,
                        message: format!("node ids must be dense and ascending, got {id}"),
                    });
                }
                mesh.geometry.add_node(fields[1], fields[2], fields[3]);
            }
            Block::Element { elset, material } => {
                let fields: Vec<usize> = parse_fields(trimmed, line_no)?;
                if fields.len() != 9 {
                    return Err(HfeError::DeckParse {
                        line: line_no,
                        message: format!("C3D8 line needs 9 ids, got {}", fields.len()),
                    });
                }
                let mut nodes = [0usize; 8];
                nodes.copy_from_slice(&fields[1..]);
                mesh.connectivity
                    .add_element(Hex8Element::new(fields[0], nodes, *material));
                mesh.connectivity.add_to_set(elset, fields[0]);
            }
            Block::NodeSet(name) => {
                let ids: Vec<usize> = parse_fields(trimmed, line_no)?;
                mesh.geometry
                    .node_sets
                    .entry(name.clone())
                    .or_default()
                    .extend(ids);
            }
            Block::ElementSet(name) => {
                let ids: Vec<usize> = parse_fields(trimmed, line_no)?;
                mesh.connectivity.element_sets.entry(name.clone()).or_default().extend(ids);
            }
        }
    }

    if !mesh.references_are_valid() {
        return Err(HfeError::DeckParse {
            line: 0,
            message: "element references a node that does not exist".to_string(),
        });
    }
    Ok(mesh)
}

/// Serialize and re-parse, checking that nothing was lost.
///
/// Elements come back grouped by material; within a material their order is
/// preserved.
pub fn round_trip(mesh: &Mesh) -> HfeResult<Mesh> {
    let mut buffer = Vec::new();
    write_mesh(&mut buffer, mesh)?;
    let parsed = read_mesh(buffer.as_slice())?;

    let checks = [
        ("node", mesh.num_nodes(), parsed.num_nodes()),
        ("element", mesh.num_elements(), parsed.num_elements()),
        ("node set", mesh.geometry.node_sets.len(), parsed.geometry.node_sets.len()),
        (
            "element set",
            mesh.connectivity.element_sets.len(),
            parsed.connectivity.element_sets.len(),
        ),
    ];
    for (what, expected, found) in checks {
        if expected != found {
            return Err(HfeError::MeshCountMismatch {
                what,
                expected,
                found,
            });
        }
    }
    debug!(bytes = buffer.len(), "Mesh description round trip verified");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_generator::HexMeshGenerator;
    use nalgebra::Vector3;

    #[test]
    fn test_round_trip_fidelity() {
        let mesh = HexMeshGenerator::full_block([3, 2, 2], Vector3::new(1.2747, 1.2747, 1.2747), [1, 1], true).unwrap();
        let parsed = round_trip(&mesh).unwrap();
        assert_eq!(parsed, mesh);
    }

    #[test]
    fn test_parse_ignores_comments_and_unknown_keywords() {
        let text = "\
** comment
*HEADING
*NODE
1, 0., 0., 0.
2, 1., 0., 0.
3, 1., 1., 0.
4, 0., 1., 0.
5, 0., 0., 1.
6, 1., 0., 1.
7, 1., 1., 1.
8, 0., 1., 1.
*ELEMENT, TYPE=C3D8, ELSET=SET7
1, 1, 2, 3, 4, 5, 6, 7, 8
*NSET, NSET=BOTTOM
1, 2, 3,
4
*SOLID SECTION, ELSET=SET7, MATERIAL=M
";
        let mesh = read_mesh(text.as_bytes()).unwrap();
        assert_eq!(mesh.num_nodes(), 8);
        assert_eq!(mesh.connectivity.hex8_elements[0].material_id, 7);
        assert_eq!(mesh.geometry.node_sets["BOTTOM"], vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_errors() {
        let bad_type = "*NODE\n1, 0, 0, 0\n*ELEMENT, TYPE=C3D4\n1, 1, 1, 1, 1\n";
        assert!(matches!(read_mesh(bad_type.as_bytes()), Err(HfeError::DeckParse { line: 3, .. })));

        let sparse = "*NODE\n1, 0, 0, 0\n3, 0, 0, 0\n";
        assert!(matches!(read_mesh(sparse.as_bytes()), Err(HfeError::DeckParse { line: 3, .. })));

        let dangling = "*NODE\n1, 0, 0, 0\n*ELEMENT, TYPE=C3D8\n1, 1, 2, 3, 4, 5, 6, 7, 8\n";
        assert!(read_mesh(dangling.as_bytes()).is_err());
    }
}
