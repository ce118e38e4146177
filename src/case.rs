use std::path::{Path, PathBuf};

use json::JsonValue;
use log::info;

use crate::{
    error::InfuseError,
    materials::RosetteSelector,
    model::Model,
    post_processor::OutputOptions,
    psolver::SolverOptions,
};

/// A model built from a case file, ready to solve
pub struct Case {
    pub model: Model,
    pub result_name: String,
    pub output: OutputOptions,
}

/// Parses the case file into a JsonValue object
///
/// # Arguments
/// * `contents` - The case file text
///
/// # Returns
/// A JsonValue object with the required sections present
pub fn parse_case_json(contents: &str) -> Result<JsonValue, InfuseError> {
    let case_json = match json::parse(contents) {
        Ok(f) => f,
        Err(err) => return Err(InfuseError::Config(format!("Error in case file json: {err}"))),
    };

    if !case_json.is_object() {
        return Err(InfuseError::Config(
            "Case file must contain a json object".to_string(),
        ));
    }
    if !case_json.has_key("mesh") {
        return Err(InfuseError::Config(
            "Case file missing mesh field".to_string(),
        ));
    }
    if !case_json.has_key("materials") {
        return Err(InfuseError::Config(
            "Case file missing materials field".to_string(),
        ));
    }
    if !case_json.has_key("inlets") {
        return Err(InfuseError::Config(
            "Case file missing inlets field".to_string(),
        ));
    }

    Ok(case_json)
}

fn required_f64(value: &JsonValue, key: &str, context: &str) -> Result<f64, InfuseError> {
    if !value.has_key(key) {
        return Err(InfuseError::Config(format!(
            "{context} is missing {key} field"
        )));
    }
    value[key]
        .as_f64()
        .ok_or_else(|| InfuseError::Config(format!("Bad value for {key} in {context}")))
}

fn vector3(value: &JsonValue, context: &str) -> Result<[f64; 3], InfuseError> {
    let components: Vec<f64> = value.members().filter_map(|m| m.as_f64()).collect();
    if !value.is_array() || value.len() != 3 || components.len() != 3 {
        return Err(InfuseError::Config(format!(
            "{context} must be an array of three numbers"
        )));
    }
    Ok([components[0], components[1], components[2]])
}

fn apply_simulation_parameters(model: &mut Model, section: &JsonValue) -> Result<(), InfuseError> {
    for (key, value) in section.entries() {
        if let Some(flag) = value.as_bool() {
            model.assign_simulation_parameter(key, flag)?;
        } else if let Some(number) = value.as_f64() {
            model.assign_simulation_parameter(key, number)?;
        } else {
            return Err(InfuseError::Config(format!(
                "Bad value for simulation parameter {key}"
            )));
        }
    }
    Ok(())
}

fn apply_materials(model: &mut Model, section: &JsonValue) -> Result<(), InfuseError> {
    for (name, material_json) in section.entries() {
        let context = format!("Material '{name}'");
        if !material_json.has_key("k") {
            return Err(InfuseError::Config(format!("{context} is missing k field")));
        }
        let k = vector3(&material_json["k"], &format!("k of {context}"))?;
        let porosity = required_f64(material_json, "porosity", &context)?;
        let thickness = required_f64(material_json, "thickness", &context)?;
        model.create_material(k, porosity, thickness, Some(name))?;

        let rosette = if material_json.has_key("rosette") {
            let axis = vector3(&material_json["rosette"], &format!("rosette of {context}"))?;
            let id = model.create_rosette(axis, [0.0; 3], Some(&format!("{name}_rosette")))?;
            Some(RosetteSelector::from(id))
        } else {
            None
        };

        if !material_json.has_key("regions") || !material_json["regions"].is_array() {
            return Err(InfuseError::Config(format!(
                "{context} is missing regions field"
            )));
        }
        for region in material_json["regions"].members() {
            let tag = region.as_str().ok_or_else(|| {
                InfuseError::Config(format!("Bad region name in {context}"))
            })?;
            model.assign_material(name, tag, rosette.clone())?;
        }
    }
    Ok(())
}

fn apply_inlets(model: &mut Model, section: &JsonValue) -> Result<(), InfuseError> {
    for (name, inlet_json) in section.entries() {
        let context = format!("Inlet '{name}'");
        let pressure = required_f64(inlet_json, "pressure", &context)?;
        let boundary = inlet_json["boundary"]
            .as_str()
            .ok_or_else(|| InfuseError::Config(format!("{context} is missing boundary field")))?;
        let id = model.create_inlet(pressure, Some(name))?;
        model.assign_inlet(id, boundary)?;
    }
    Ok(())
}

fn parse_solver_options(section: &JsonValue) -> Result<SolverOptions, InfuseError> {
    let mut options = SolverOptions::default();
    if section.is_null() {
        return Ok(options);
    }
    if section.has_key("type") {
        let solver_type = section["type"]
            .as_str()
            .ok_or_else(|| InfuseError::Config("Bad value for solver type".to_string()))?;
        options.set_option("type", solver_type)?;
    }
    for (key, value) in section["options"].entries() {
        let text = match value.as_str() {
            Some(s) => s.to_owned(),
            None => value.dump(),
        };
        options.set_option(key, &text)?;
    }
    Ok(options)
}

fn parse_output(
    section: &JsonValue,
    default_name: &str,
    base_dir: &Path,
) -> Result<(String, OutputOptions), InfuseError> {
    let mut output = OutputOptions::default();
    let name = section["name"].as_str().unwrap_or(default_name).to_owned();
    if section.has_key("format") {
        output.format = section["format"]
            .as_str()
            .ok_or_else(|| InfuseError::Config("Bad value for output format".to_string()))?
            .parse()?;
    }
    let directory = section["directory"].as_str().map(PathBuf::from);
    output.directory = base_dir.join(directory.unwrap_or(output.directory));
    Ok((name, output))
}

/// Builds a model from case file text. Relative paths are resolved against
/// `base_dir`.
pub fn parse_case(contents: &str, base_dir: &Path) -> Result<Case, InfuseError> {
    let case_json = parse_case_json(contents)?;

    let mesh_path = case_json["mesh"]
        .as_str()
        .ok_or_else(|| InfuseError::Config("Bad value for mesh in case file".to_string()))?;
    let mut model = Model::new();
    model.read_mesh_file(base_dir.join(mesh_path))?;

    if case_json.has_key("simulation") {
        apply_simulation_parameters(&mut model, &case_json["simulation"])?;
    }
    apply_materials(&mut model, &case_json["materials"])?;
    apply_inlets(&mut model, &case_json["inlets"])?;
    for (i, position) in case_json["sensors"].members().enumerate() {
        let [x, y, z] = vector3(position, &format!("Sensor {i}"))?;
        model.create_sensor(x, y, z);
    }

    let options = parse_solver_options(&case_json["solver"])?;
    let default_name = model
        .mesh()
        .map(|m| m.case_name.clone())
        .unwrap_or_else(|| "result".to_owned());
    let (result_name, output) = parse_output(&case_json["output"], &default_name, base_dir)?;

    model.initialise_solver(options)?;
    info!("loaded case '{result_name}'");
    Ok(Case {
        model,
        result_name,
        output,
    })
}

/// Reads and builds a case file
pub fn load_case(path: impl AsRef<Path>) -> Result<Case, InfuseError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(f) => f,
        Err(err) => {
            return Err(InfuseError::Config(format!(
                "Unable to open case file {}: {err}",
                path.display()
            )))
        }
    };
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_case(&contents, base_dir)
}
