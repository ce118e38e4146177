use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info};
use nalgebra::Vector3;

use crate::error::InfuseError;

const MSH_LINE: usize = 1;
const MSH_TRIANGLE: usize = 2;

enum MeshParseState {
    Format,
    PhysicalNames,
    Entities,
    Nodes,
    Elements,
    Limbo,
}

/// Raw mesh content: node coordinates, triangle connectivity and the
/// physical groups of the file, with all node references as dense indices.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub case_name: String,
    pub coords: Vec<Vector3<f64>>,
    pub triangles: Vec<[usize; 3]>,
    /// Name of the first physical surface group of each triangle
    pub triangle_tags: Vec<Option<String>>,
    /// Physical surface name -> triangle indices
    pub physical_domains: BTreeMap<String, Vec<usize>>,
    /// Physical curve name -> line segments
    pub physical_lines: BTreeMap<String, Vec<[usize; 2]>>,
    /// Physical curve name -> sorted unique node indices
    pub boundary_nodes: BTreeMap<String, Vec<usize>>,
}

impl MeshData {
    pub fn summary(&self) -> String {
        format!(
            "Mesh file format: MSH (v4 ASCII)\n\
             Case name:        {}\n\
             Mesh contains {} nodes, {} elements.\n\
             Physical domains: {:?}\n\
             Physical lines:   {:?}",
            self.case_name,
            self.coords.len(),
            self.triangles.len(),
            self.physical_domains.keys().collect::<Vec<_>>(),
            self.physical_lines.keys().collect::<Vec<_>>(),
        )
    }
}

/// An element block as read from the file, before tags are resolved
struct RawBlock {
    entity_dim: usize,
    entity_tag: i64,
    element_type: usize,
    connectivity: Vec<Vec<usize>>,
}

fn format_error(section: &str, detail: impl Display) -> InfuseError {
    InfuseError::MeshFormat(format!("{section}: {detail}"))
}

/// Splits a line into whitespace separated values
fn parse_fields<T: FromStr>(line: &str, section: &str) -> Result<Vec<T>, InfuseError> {
    line.split_whitespace()
        .map(|v| {
            v.parse()
                .map_err(|_| format_error(section, format!("unexpected value '{v}'")))
        })
        .collect()
}

fn next_line<'a, I: Iterator<Item = &'a str>>(
    lines: &mut I,
    section: &str,
) -> Result<&'a str, InfuseError> {
    lines
        .next()
        .ok_or_else(|| format_error(section, "unexpected end of file"))
}

fn field<T: Copy>(values: &[T], i: usize, section: &str) -> Result<T, InfuseError> {
    values
        .get(i)
        .copied()
        .ok_or_else(|| format_error(section, "missing field"))
}

/// Parses the physical tags out of an `$Entities` record. Points carry
/// `tag x y z`, curves, surfaces and volumes carry `tag` plus a bounding box.
fn entity_physicals(values: &[f64], dim: usize) -> Result<(i64, Vec<i64>), InfuseError> {
    let offset = if dim == 0 { 4 } else { 7 };
    let tag = field(values, 0, "$Entities")? as i64;
    let num_physicals = field(values, offset, "$Entities")? as usize;
    let physicals = (0..num_physicals)
        .map(|i| field(values, offset + 1 + i, "$Entities").map(|v| v as i64))
        .collect::<Result<Vec<i64>, InfuseError>>()?;
    Ok((tag, physicals))
}

/// Parses the contents of a Gmsh .msh file (version 4.1, ASCII)
///
/// # Arguments
/// * `contents` - The text of the mesh file
/// * `case_name` - Label stored with the mesh data
///
/// # Returns
/// The parsed MeshData
pub fn parse_msh(contents: &str, case_name: &str) -> Result<MeshData, InfuseError> {
    let mut parser_state = MeshParseState::Limbo;
    let mut lines = contents.lines().map(|l| l.trim()).filter(|l| !l.is_empty());

    let mut format_seen = false;
    let mut physical_names: HashMap<(usize, i64), String> = HashMap::new();
    let mut entity_physicals_map: HashMap<(usize, i64), Vec<i64>> = HashMap::new();
    let mut node_index: HashMap<usize, usize> = HashMap::new();
    let mut coords: Vec<Vector3<f64>> = Vec::new();
    let mut blocks: Vec<RawBlock> = Vec::new();

    while let Some(line) = lines.next() {
        if line.starts_with("$End") {
            parser_state = MeshParseState::Limbo;
            continue;
        }

        match parser_state {
            MeshParseState::Limbo => {
                if line.starts_with("$MeshFormat") {
                    parser_state = MeshParseState::Format;
                } else if line.starts_with("$PhysicalNames") {
                    parser_state = MeshParseState::PhysicalNames;
                } else if line.starts_with("$Entities") {
                    parser_state = MeshParseState::Entities;
                } else if line.starts_with("$Nodes") {
                    parser_state = MeshParseState::Nodes;
                } else if line.starts_with("$Elements") {
                    parser_state = MeshParseState::Elements;
                } else if line.starts_with('$') {
                    debug!("skipping mesh section {line}");
                }
            }
            MeshParseState::Format => {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let version = fields.first().copied().unwrap_or_default();
                let file_type = fields.get(1).copied().unwrap_or_default();
                if !version.starts_with("4.") || version == "4.0" {
                    return Err(format_error(
                        "$MeshFormat",
                        format!("unsupported version {version}, expected 4.1"),
                    ));
                }
                if file_type != "0" {
                    return Err(format_error(
                        "$MeshFormat",
                        "binary mesh files are not supported",
                    ));
                }
                format_seen = true;
            }
            MeshParseState::PhysicalNames => {
                let header = parse_fields::<usize>(line, "$PhysicalNames")?;
                let count = field(&header, 0, "$PhysicalNames")?;
                for _ in 0..count {
                    let entry = next_line(&mut lines, "$PhysicalNames")?;
                    let mut parts = entry.splitn(3, char::is_whitespace);
                    let dim: usize = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| format_error("$PhysicalNames", entry))?;
                    let tag: i64 = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| format_error("$PhysicalNames", entry))?;
                    let name = parts
                        .next()
                        .map(|n| n.trim().trim_matches('"').to_owned())
                        .ok_or_else(|| format_error("$PhysicalNames", entry))?;
                    physical_names.insert((dim, tag), name);
                }
            }
            MeshParseState::Entities => {
                let counts: Vec<usize> = parse_fields(line, "$Entities")?;
                for dim in 0..4 {
                    for _ in 0..field(&counts, dim, "$Entities")? {
                        let values: Vec<f64> =
                            parse_fields(next_line(&mut lines, "$Entities")?, "$Entities")?;
                        let (tag, physicals) = entity_physicals(&values, dim)?;
                        entity_physicals_map.insert((dim, tag), physicals);
                    }
                }
            }
            MeshParseState::Nodes => {
                let header: Vec<usize> = parse_fields(line, "$Nodes")?;
                let num_blocks = field(&header, 0, "$Nodes")?;
                coords.reserve(field(&header, 1, "$Nodes")?);

                for _ in 0..num_blocks {
                    let block: Vec<usize> =
                        parse_fields(next_line(&mut lines, "$Nodes")?, "$Nodes")?;
                    let num_nodes_local = field(&block, 3, "$Nodes")?;

                    let mut node_tags: Vec<usize> = Vec::with_capacity(num_nodes_local);
                    for _ in 0..num_nodes_local {
                        let tag: Vec<usize> =
                            parse_fields(next_line(&mut lines, "$Nodes")?, "$Nodes")?;
                        node_tags.push(field(&tag, 0, "$Nodes")?);
                    }

                    for tag in node_tags {
                        let node_coords: Vec<f64> =
                            parse_fields(next_line(&mut lines, "$Nodes")?, "$Nodes")?;
                        if node_coords.len() < 3 {
                            return Err(format_error("$Nodes", "node with fewer than 3 coordinates"));
                        }
                        node_index.insert(tag, coords.len());
                        coords.push(Vector3::new(node_coords[0], node_coords[1], node_coords[2]));
                    }
                }
            }
            MeshParseState::Elements => {
                let header: Vec<usize> = parse_fields(line, "$Elements")?;
                let num_blocks = field(&header, 0, "$Elements")?;

                for _ in 0..num_blocks {
                    let block: Vec<i64> =
                        parse_fields(next_line(&mut lines, "$Elements")?, "$Elements")?;
                    let entity_dim = field(&block, 0, "$Elements")? as usize;
                    let entity_tag = field(&block, 1, "$Elements")?;
                    let element_type = field(&block, 2, "$Elements")? as usize;
                    let num_elements = field(&block, 3, "$Elements")? as usize;

                    let mut connectivity = Vec::with_capacity(num_elements);
                    for _ in 0..num_elements {
                        let metadata: Vec<usize> =
                            parse_fields(next_line(&mut lines, "$Elements")?, "$Elements")?;
                        connectivity.push(metadata.into_iter().skip(1).collect());
                    }

                    if element_type != MSH_LINE && element_type != MSH_TRIANGLE {
                        debug!(
                            "skipping {} elements of type {element_type}",
                            connectivity.len()
                        );
                        continue;
                    }
                    blocks.push(RawBlock {
                        entity_dim,
                        entity_tag,
                        element_type,
                        connectivity,
                    });
                }
            }
        }
    }

    if !format_seen {
        return Err(format_error("$MeshFormat", "missing mesh format header"));
    }

    build_mesh_data(
        case_name,
        coords,
        &node_index,
        &blocks,
        &physical_names,
        &entity_physicals_map,
    )
}

/// Resolves node tags and physical groups, and drops nodes that no triangle
/// references
fn build_mesh_data(
    case_name: &str,
    coords: Vec<Vector3<f64>>,
    node_index: &HashMap<usize, usize>,
    blocks: &[RawBlock],
    physical_names: &HashMap<(usize, i64), String>,
    entity_physicals_map: &HashMap<(usize, i64), Vec<i64>>,
) -> Result<MeshData, InfuseError> {
    let resolve = |tag: usize| -> Result<usize, InfuseError> {
        node_index
            .get(&tag)
            .copied()
            .ok_or_else(|| format_error("$Elements", format!("reference to unknown node {tag}")))
    };
    let group_names = |dim: usize, entity_tag: i64| -> Vec<String> {
        entity_physicals_map
            .get(&(dim, entity_tag))
            .map(|physicals| {
                physicals
                    .iter()
                    .map(|p| {
                        physical_names
                            .get(&(dim, *p))
                            .cloned()
                            .unwrap_or_else(|| p.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut triangles: Vec<[usize; 3]> = Vec::new();
    let mut triangle_tags: Vec<Option<String>> = Vec::new();
    let mut physical_domains: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut raw_lines: BTreeMap<String, Vec<[usize; 2]>> = BTreeMap::new();

    for block in blocks {
        let names = group_names(block.entity_dim, block.entity_tag);
        for conn in &block.connectivity {
            match block.element_type {
                MSH_TRIANGLE => {
                    if conn.len() < 3 {
                        return Err(format_error("$Elements", "triangle with fewer than 3 nodes"));
                    }
                    let id = triangles.len();
                    triangles.push([resolve(conn[0])?, resolve(conn[1])?, resolve(conn[2])?]);
                    triangle_tags.push(names.first().cloned());
                    for name in &names {
                        physical_domains.entry(name.clone()).or_default().push(id);
                    }
                }
                _ => {
                    if conn.len() < 2 {
                        return Err(format_error("$Elements", "line with fewer than 2 nodes"));
                    }
                    let segment = [resolve(conn[0])?, resolve(conn[1])?];
                    for name in &names {
                        raw_lines.entry(name.clone()).or_default().push(segment);
                    }
                }
            }
        }
    }

    if triangles.is_empty() {
        return Err(InfuseError::MeshFormat(
            "mesh contains no triangle elements".to_owned(),
        ));
    }

    // Compact the node numbering to the nodes used by triangles
    let mut remap: Vec<Option<usize>> = vec![None; coords.len()];
    let mut compact_coords: Vec<Vector3<f64>> = Vec::with_capacity(coords.len());
    for triangle in triangles.iter_mut() {
        for node in triangle.iter_mut() {
            let new_idx = *remap[*node].get_or_insert_with(|| {
                compact_coords.push(coords[*node]);
                compact_coords.len() - 1
            });
            *node = new_idx;
        }
    }

    let mut physical_lines: BTreeMap<String, Vec<[usize; 2]>> = BTreeMap::new();
    let mut boundary_nodes: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (name, segments) in raw_lines {
        let kept: Vec<[usize; 2]> = segments
            .iter()
            .filter_map(|[a, b]| Some([remap[*a]?, remap[*b]?]))
            .collect();
        let mut nodes: Vec<usize> = kept.iter().flatten().copied().collect();
        nodes.sort_unstable();
        nodes.dedup();
        boundary_nodes.insert(name.clone(), nodes);
        physical_lines.insert(name, kept);
    }

    info!(
        "loaded {} nodes and {} elements",
        compact_coords.len(),
        triangles.len()
    );

    Ok(MeshData {
        case_name: case_name.to_owned(),
        coords: compact_coords,
        triangles,
        triangle_tags,
        physical_domains,
        physical_lines,
        boundary_nodes,
    })
}

/// Reads a .msh file into MeshData
///
/// # Arguments
/// * `mesh_file` - The path to the mesh file
pub fn read_mesh_file(mesh_file: impl AsRef<Path>) -> Result<MeshData, InfuseError> {
    let path = mesh_file.as_ref();

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            return Err(InfuseError::MeshNotFound(format!(
                "unable to open mesh file {}: {err}",
                path.display()
            )))
        }
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("msh") => {}
        _ => {
            return Err(InfuseError::MeshFormat(format!(
                "unrecognized mesh filetype {}, only .msh is supported",
                path.display()
            )))
        }
    }

    info!("reading mesh file {}", path.display());
    let case_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("case");
    parse_msh(&contents, case_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit square split along its diagonal, left edge tagged as an inlet
    const SQUARE: &str = r#"$MeshFormat
4.1 0 8
$EndMeshFormat
$PhysicalNames
2
1 1 "left_edge"
2 2 "domain"
$EndPhysicalNames
$Entities
0 1 1 0
4 0 0 0 0 1 0 1 1 0
1 0 0 0 1 1 0 1 2 0
$EndEntities
$Nodes
1 5 1 5
2 1 0 5
1
2
3
4
5
0 0 0
1 0 0
1 1 0
0 1 0
7 7 0
$EndNodes
$Elements
2 3 1 3
1 4 1 1
1 1 4
2 1 2 2
2 1 2 3
3 1 3 4
$EndElements
"#;

    #[test]
    fn parses_nodes_triangles_and_groups() {
        let data = parse_msh(SQUARE, "square").unwrap();
        assert_eq!(data.coords.len(), 4, "unused node 5 is dropped");
        assert_eq!(data.triangles, vec![[0, 1, 2], [0, 2, 3]]);
        assert_eq!(data.triangle_tags, vec![Some("domain".to_owned()); 2]);
        assert_eq!(data.physical_domains["domain"], vec![0, 1]);
        assert_eq!(data.physical_lines["left_edge"], vec![[0, 3]]);
        assert_eq!(data.boundary_nodes["left_edge"], vec![0, 3]);
        assert_eq!(data.coords[2], Vector3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn rejects_old_and_binary_formats() {
        let old = SQUARE.replace("4.1 0 8", "2.2 0 8");
        assert!(matches!(
            parse_msh(&old, "old"),
            Err(InfuseError::MeshFormat(_))
        ));
        let binary = SQUARE.replace("4.1 0 8", "4.1 1 8");
        assert!(matches!(
            parse_msh(&binary, "binary"),
            Err(InfuseError::MeshFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_sections() {
        let truncated = &SQUARE[..SQUARE.find("3 1 3 4").unwrap()];
        assert!(matches!(
            parse_msh(truncated, "truncated"),
            Err(InfuseError::MeshFormat(_))
        ));
    }

    #[test]
    fn missing_file_is_distinguished_from_bad_format() {
        assert!(matches!(
            read_mesh_file("does/not/exist.msh"),
            Err(InfuseError::MeshNotFound(_))
        ));
    }
}
