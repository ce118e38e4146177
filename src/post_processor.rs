use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::info;
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::InfuseError,
    mesh::Mesh,
    sensors::Sensor,
    timestep::{Solution, SolutionStep},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// XDMF 3 temporal collection with inline XML data
    #[default]
    Xdmf,
    /// The packed solution as JSON
    Json,
    /// Final step as `nodes.csv` and `elements.csv`
    Csv,
}

impl FromStr for OutputFormat {
    type Err = InfuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xdmf" => Ok(OutputFormat::Xdmf),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(InfuseError::Config(format!(
                "unknown output format '{other}', expected 'xdmf', 'json' or 'csv'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputOptions {
    pub format: OutputFormat,
    /// Parent of the per-result folders
    pub directory: PathBuf,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            format: OutputFormat::default(),
            directory: PathBuf::from("results"),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> InfuseError {
    InfuseError::Output(format!("failed to write {}: {err}", path.display()))
}

fn xml_error(err: quick_xml::Error) -> InfuseError {
    InfuseError::Output(format!("failed to write XDMF: {err}"))
}

fn create_file(path: &Path) -> Result<BufWriter<File>, InfuseError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|err| io_error(path, err))
}

/// Thin layer over the quick-xml event writer
struct XmlWriter<W: Write> {
    writer: Writer<W>,
}

impl<W: Write> XmlWriter<W> {
    fn start(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), InfuseError> {
        let element = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.writer
            .write_event(Event::Start(element))
            .map_err(xml_error)
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), InfuseError> {
        let element = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.writer
            .write_event(Event::Empty(element))
            .map_err(xml_error)
    }

    fn end(&mut self, name: &str) -> Result<(), InfuseError> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_error)
    }

    /// Writes a `DataItem` holding `values` laid out in rows of `width`
    fn data_item<T: ToString>(
        &mut self,
        values: impl Iterator<Item = T>,
        rows: usize,
        width: usize,
        number_type: &str,
    ) -> Result<(), InfuseError> {
        let dimensions = if width == 1 {
            rows.to_string()
        } else {
            format!("{rows} {width}")
        };
        let mut attributes = vec![
            ("Dimensions", dimensions.as_str()),
            ("NumberType", number_type),
            ("Format", "XML"),
        ];
        if number_type == "Float" {
            attributes.push(("Precision", "8"));
        }
        self.start("DataItem", &attributes)?;

        let values: Vec<String> = values.map(|v| v.to_string()).collect();
        let mut text = String::with_capacity(values.len() * 12);
        for row in values.chunks(width.max(1)) {
            text.push('\n');
            text.push_str(&row.join(" "));
        }
        text.push('\n');
        self.writer
            .write_event(Event::Text(BytesText::new(&text)))
            .map_err(xml_error)?;
        self.end("DataItem")
    }

    fn attribute(
        &mut self,
        name: &str,
        center: &str,
        values: &[f64],
        rows: usize,
        width: usize,
    ) -> Result<(), InfuseError> {
        let kind = if width == 1 { "Scalar" } else { "Vector" };
        self.start(
            "Attribute",
            &[("Name", name), ("AttributeType", kind), ("Center", center)],
        )?;
        self.data_item(values.iter(), rows, width, "Float")?;
        self.end("Attribute")
    }
}

fn flatten(vectors: &[[f64; 3]]) -> Vec<f64> {
    vectors.iter().flatten().copied().collect()
}

fn write_step_grid<W: Write>(
    xml: &mut XmlWriter<W>,
    mesh: &Mesh,
    step: &SolutionStep,
) -> Result<(), InfuseError> {
    let n_nodes = mesh.n_nodes();
    let n_elements = mesh.n_elements();
    let grid_name = format!("step_{}", step.index);
    let time = step.time.to_string();
    let n_elements_str = n_elements.to_string();

    xml.start("Grid", &[("Name", &grid_name), ("GridType", "Uniform")])?;
    xml.empty("Time", &[("Value", &time)])?;

    xml.start(
        "Topology",
        &[
            ("TopologyType", "Triangle"),
            ("NumberOfElements", &n_elements_str),
        ],
    )?;
    xml.data_item(
        mesh.elements.iter().flat_map(|e| e.nodes),
        n_elements,
        3,
        "Int",
    )?;
    xml.end("Topology")?;

    xml.start("Geometry", &[("GeometryType", "XYZ")])?;
    xml.data_item(mesh.flat_coords().into_iter(), n_nodes, 3, "Float")?;
    xml.end("Geometry")?;

    xml.attribute("Pressure", "Node", &step.pressure, n_nodes, 1)?;
    xml.attribute("FillFactor", "Node", &step.fill_factor, n_nodes, 1)?;
    xml.attribute("FreeSurface", "Node", &step.free_surface, n_nodes, 1)?;
    xml.attribute(
        "NodalVelocity",
        "Node",
        &flatten(&step.nodal_velocity),
        n_nodes,
        3,
    )?;
    xml.attribute("Velocity", "Cell", &flatten(&step.velocity), n_elements, 3)?;

    xml.end("Grid")
}

/// Writes a solution as an XDMF 3 temporal collection, one uniform grid per
/// written-out step
///
/// # Arguments
/// * `writer` - The destination
/// * `mesh` - The mesh the solution was computed on
/// * `solution` - The packed solution
pub fn write_xdmf<W: Write>(writer: W, mesh: &Mesh, solution: &Solution) -> Result<(), InfuseError> {
    let mut xml = XmlWriter {
        writer: Writer::new_with_indent(writer, b' ', 2),
    };
    xml.writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    xml.start("Xdmf", &[("Version", "3.0")])?;
    xml.start("Domain", &[])?;
    xml.start(
        "Grid",
        &[
            ("Name", mesh.case_name.as_str()),
            ("GridType", "Collection"),
            ("CollectionType", "Temporal"),
        ],
    )?;
    for step in &solution.steps {
        write_step_grid(&mut xml, mesh, step)?;
    }
    xml.end("Grid")?;
    xml.end("Domain")?;
    xml.end("Xdmf")?;

    xml.writer
        .into_inner()
        .flush()
        .map_err(|err| InfuseError::Output(format!("failed to flush XDMF output: {err}")))
}

/// Writes one step to two CSV files
///
/// # Arguments
/// * `mesh` - The mesh the solution was computed on
/// * `step` - The step to write
/// * `nodes_output` - The path of the output nodes csv
/// * `elements_output` - The path of the output elements csv
pub fn csv_output(
    mesh: &Mesh,
    step: &SolutionStep,
    nodes_output: &Path,
    elements_output: &Path,
) -> Result<(), InfuseError> {
    let mut nodes_file = create_file(nodes_output)?;
    let mut elements_file = create_file(elements_output)?;

    // Write nodes
    let write_nodes = |file: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(file, "x,y,z,p,fill,free_surface")?;
        for (i, node) in mesh.nodes.iter().enumerate() {
            writeln!(
                file,
                "{x},{y},{z},{p},{fill},{front}",
                x = node.coords.x,
                y = node.coords.y,
                z = node.coords.z,
                p = step.pressure[i],
                fill = step.fill_factor[i],
                front = step.free_surface[i],
            )?;
        }
        file.flush()
    };
    write_nodes(&mut nodes_file).map_err(|err| io_error(nodes_output, err))?;

    // Write elements
    let write_elements = |file: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(file, "n0,n1,n2,vx,vy,vz")?;
        for (element, v) in mesh.elements.iter().zip(&step.velocity) {
            writeln!(
                file,
                "{n0},{n1},{n2},{vx},{vy},{vz}",
                n0 = element.nodes[0],
                n1 = element.nodes[1],
                n2 = element.nodes[2],
                vx = v[0],
                vy = v[1],
                vz = v[2],
            )?;
        }
        file.flush()
    };
    write_elements(&mut elements_file).map_err(|err| io_error(elements_output, err))?;

    info!(
        "wrote output to {} and {}",
        nodes_output.display(),
        elements_output.display()
    );
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), InfuseError> {
    let mut file = create_file(path)?;
    serde_json::to_writer(&mut file, value).map_err(|err| {
        InfuseError::Output(format!("failed to serialise {}: {err}", path.display()))
    })?;
    file.flush().map_err(|err| io_error(path, err))
}

/// Saves a solution into `<directory>/<result_name>/`, replacing any previous
/// result of the same name
///
/// # Arguments
/// * `mesh` - The mesh the solution was computed on
/// * `solution` - The packed solution
/// * `sensors` - Sensors whose histories are written to `sensors.json`
/// * `result_name` - The name of the result folder
/// * `options` - Output format and parent directory
///
/// # Returns
/// The path of the result folder
pub fn save_results(
    mesh: &Mesh,
    solution: &Solution,
    sensors: &[Sensor],
    result_name: &str,
    options: &OutputOptions,
) -> Result<PathBuf, InfuseError> {
    let last = solution
        .last()
        .ok_or_else(|| InfuseError::Output("cannot save an empty solution".into()))?;
    if result_name.is_empty() {
        return Err(InfuseError::Output("result name must not be empty".into()));
    }

    let destination = options.directory.join(result_name);
    if destination.is_dir() {
        std::fs::remove_dir_all(&destination).map_err(|err| io_error(&destination, err))?;
    }
    std::fs::create_dir_all(&destination).map_err(|err| io_error(&destination, err))?;

    match options.format {
        OutputFormat::Xdmf => {
            let path = destination.join(format!("{result_name}_RES.xdmf"));
            write_xdmf(create_file(&path)?, mesh, solution)?;
        }
        OutputFormat::Json => {
            write_json(&destination.join(format!("{result_name}_RES.json")), solution)?;
        }
        OutputFormat::Csv => {
            csv_output(
                mesh,
                last,
                &destination.join("nodes.csv"),
                &destination.join("elements.csv"),
            )?;
        }
    }

    if !sensors.is_empty() {
        write_json(&destination.join("sensors.json"), &sensors)?;
    }

    info!("results saved in {}", destination.display());
    Ok(destination)
}
