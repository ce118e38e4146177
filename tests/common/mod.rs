#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use infuse::{Model, SolverOptions};

pub const LENGTH: f64 = 1.0;
pub const HEIGHT: f64 = 0.2;
pub const NX: usize = 20;
pub const NY: usize = 4;

pub const POROSITY: f64 = 0.5;
pub const MU: f64 = 0.1;
pub const PERMEABILITY: f64 = 1e-10;

/// Fill time of a one dimensional rectilinear infusion
pub fn analytic_fill_time(length: f64, pressure: f64) -> f64 {
    POROSITY * MU * length * length / (2.0 * PERMEABILITY * pressure)
}

/// Structured rectangle `[0, length] x [0, height]` in Gmsh 4.1 ASCII, with
/// physical lines `left_edge` and `right_edge` and the surface `domain`.
/// Every cell is split along its rising diagonal.
pub fn rectangle_msh(length: f64, height: f64, nx: usize, ny: usize) -> String {
    let node_tag = |i: usize, j: usize| j * (nx + 1) + i + 1;
    let n_nodes = (nx + 1) * (ny + 1);
    let n_triangles = 2 * nx * ny;

    let mut msh = String::new();
    msh.push_str("$MeshFormat\n4.1 0 8\n$EndMeshFormat\n");
    msh.push_str("$PhysicalNames\n3\n");
    msh.push_str("1 1 \"left_edge\"\n1 2 \"right_edge\"\n2 3 \"domain\"\n");
    msh.push_str("$EndPhysicalNames\n");

    msh.push_str("$Entities\n0 2 1 0\n");
    writeln!(msh, "1 0 0 0 0 {height} 0 1 1 0").unwrap();
    writeln!(msh, "2 {length} 0 0 {length} {height} 0 1 2 0").unwrap();
    writeln!(msh, "1 0 0 0 {length} {height} 0 1 3 0").unwrap();
    msh.push_str("$EndEntities\n");

    msh.push_str("$Nodes\n");
    writeln!(msh, "1 {n_nodes} 1 {n_nodes}").unwrap();
    writeln!(msh, "2 1 0 {n_nodes}").unwrap();
    for tag in 1..=n_nodes {
        writeln!(msh, "{tag}").unwrap();
    }
    for j in 0..=ny {
        for i in 0..=nx {
            let x = length * i as f64 / nx as f64;
            let y = height * j as f64 / ny as f64;
            writeln!(msh, "{x} {y} 0").unwrap();
        }
    }
    msh.push_str("$EndNodes\n");

    let n_elements = n_triangles + 2 * ny;
    msh.push_str("$Elements\n");
    writeln!(msh, "3 {n_elements} 1 {n_elements}").unwrap();
    let mut tag = 1;
    for (entity, i) in [(1, 0), (2, nx)] {
        writeln!(msh, "1 {entity} 1 {ny}").unwrap();
        for j in 0..ny {
            writeln!(msh, "{tag} {} {}", node_tag(i, j), node_tag(i, j + 1)).unwrap();
            tag += 1;
        }
    }
    writeln!(msh, "2 1 2 {n_triangles}").unwrap();
    for j in 0..ny {
        for i in 0..nx {
            let (a, b) = (node_tag(i, j), node_tag(i + 1, j));
            let (c, d) = (node_tag(i + 1, j + 1), node_tag(i, j + 1));
            writeln!(msh, "{tag} {a} {b} {c}").unwrap();
            writeln!(msh, "{} {a} {c} {d}", tag + 1).unwrap();
            tag += 2;
        }
    }
    msh.push_str("$EndElements\n");
    msh
}

/// Writes the default rectangle into `dir` and returns its path
pub fn write_rectangle(dir: &Path) -> PathBuf {
    let path = dir.join("rect.msh");
    std::fs::write(&path, rectangle_msh(LENGTH, HEIGHT, NX, NY)).unwrap();
    path
}

/// Rectangle filled from `left_edge` at `pressure`, before the solver is
/// initialised
pub fn rectangle_model(dir: &Path, pressure: f64) -> Model {
    let mut model = Model::new();
    model.read_mesh_file(write_rectangle(dir)).unwrap();
    model
        .create_material(
            [PERMEABILITY, PERMEABILITY, PERMEABILITY],
            POROSITY,
            1.0,
            Some("glass"),
        )
        .unwrap();
    model.assign_material("glass", "domain", None).unwrap();
    let inlet = model.create_inlet(pressure, Some("inlet")).unwrap();
    model.assign_inlet(inlet, "left_edge").unwrap();
    model.assign_simulation_parameter("mu", MU).unwrap();
    model.assign_simulation_parameter("fill_tolerance", 0.0).unwrap();
    model.set_show_progress(false);
    model
}

/// Rectangle model with the solver initialised
pub fn initialised_rectangle(dir: &Path, pressure: f64, options: SolverOptions) -> Model {
    let mut model = rectangle_model(dir, pressure);
    model.initialise_solver(options).unwrap();
    model
}
