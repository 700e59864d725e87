// src/core/commands.rs

//! Built-in handlers that need more than a straight parameter lookup.

use crate::constants::{
    ACS_FILES_DIR, DEEP_LEARNING_PACKAGES_DIR, DEFAULT_MARKER, GEODATABASE_EXT,
    IMPORT_GEOMETRY_DIR, RASTER_FUNCTION_TEMPLATES_DIR, RASTER_TYPE_DIR, STATISTICS_DIR,
    XPATH_REGISTER_RASTER_QUERY,
};
use crate::core::document::{Document, NodeId};
use crate::core::engine::{Engine, EngineError, join_path, prefix_folder_path};
use crate::core::invoker::DynamicInvoker;
use crate::core::process_info::ProcessInfoError;
use crate::core::registry::CommandDefinition;
use crate::core::toolkit::{TOOL_DELETE, TOOL_MAKE_MOSAIC_LAYER, exists, list_fields};
use crate::models::{CommandStep, StepOutcome};
use crate::system::locks::{LockWait, wait_for_lock_release};
use chrono::Local;
use serde_json::Value;
use std::fs;
use std::path::Path;

// Day twice, matching the layer names existing outputs already use.
const LAYER_STAMP_FORMAT: &str = "%Y%d%d%H%M%S%f";

type HandlerResult = Result<StepOutcome, EngineError>;

/// Rows of a table as `[[objectid, name], ...]`.
pub const TOOL_SEARCH_ROWS: &str = "da.SearchCursor";

// --- Shared helpers ---

fn params(
    engine: &Engine,
    def: &CommandDefinition,
    keys: &[&str],
    index: usize,
) -> Result<Vec<Value>, EngineError> {
    keys.iter()
        .map(|k| engine.param_value(def.process_key, k, index))
        .collect()
}

fn root_str(engine: &Engine) -> String {
    engine.root.to_string_lossy().replace('\\', "/")
}

/// `<root>/<dir>`.
fn parameter_dir(engine: &Engine, dir: &str) -> String {
    join_path(&root_str(engine), dir)
}

/// True for `name.ext` values without any folder part.
fn is_bare_file(value: &str, ext: &str) -> bool {
    value.contains(ext) && !value.contains('/')
}

/// Case-insensitive child text, trimmed.
fn child_text_ci(doc: &Document, id: NodeId, name: &str) -> Option<String> {
    doc.children(id)
        .iter()
        .find(|&&c| doc.name(c).eq_ignore_ascii_case(name))
        .and_then(|&c| doc.text(c))
        .map(|t| t.trim().to_string())
}

fn mosaic_dataset_node(engine: &Engine) -> Result<NodeId, EngineError> {
    engine
        .document
        .elements_by_name("MosaicDataset")
        .next()
        .ok_or_else(|| ProcessInfoError::MissingMosaicDataset.into())
}

/// Runs a fully assembled argument list through the invocation adapter.
fn invoke_with_args(engine: &mut Engine, function: &str, args: Vec<Value>) -> StepOutcome {
    let mut invoker = DynamicInvoker::new(function, args);
    if !invoker.prepare(engine.toolkit.as_ref(), &mut engine.log) {
        return StepOutcome::failed();
    }
    StepOutcome::from_status(invoker.invoke(engine.toolkit.as_mut(), None, &mut engine.log))
}

/// `OBJECTID >n`, restricting work to the rows the current run added.
fn new_rows_expression(engine: &Engine) -> String {
    format!("OBJECTID >{}", engine.base.last_object_id)
}

/// Calls `function` on a temporary mosaic layer over the new rows, passing
/// the layer as first argument. The layer is deleted afterwards either way.
fn on_new_rows_layer(engine: &mut Engine, function: &str, mut args: Vec<Value>) -> HandlerResult {
    let layer = format!("lyr_{}", engine.base.last_object_id);
    let expression = new_rows_expression(engine);
    engine.call_tool(
        TOOL_MAKE_MOSAIC_LAYER,
        &[
            Value::from(engine.md_path()),
            Value::from(layer.as_str()),
            Value::from(expression),
        ],
    )?;
    args.insert(0, Value::from(layer.as_str()));
    let result = engine.call_tool(function, &args);
    if let Err(e) = engine.call_tool(TOOL_DELETE, &[Value::from(layer.as_str())]) {
        engine.log.warning(&format!("Failed to delete the layer {layer}: {e}"));
    }
    result.map(|_| StepOutcome::ok())
}

// --- Creation ---

/// CM: geodatabase (unless enterprise), then the mosaic dataset.
pub fn create_mosaic_dataset(engine: &mut Engine, _def: &'static CommandDefinition, _step: &CommandStep) -> HandlerResult {
    let md_node = mosaic_dataset_node(engine)?;
    let read = |tag: &str| engine.document.child_text(md_node, tag).unwrap_or_default();
    let srs = read("SRS");
    let pixel_type = read("pixel_type");
    let num_bands = read("num_bands");
    let product_definition = read("product_definition");
    let product_band_definitions = read("product_band_definitions");

    if !create_geodatabase(engine) {
        return Ok(StepOutcome::failed());
    }

    engine.log.general("Creating source mosaic datasets:");
    let md_path = engine.md_path();
    if exists(engine.toolkit.as_mut(), &md_path) {
        return Ok(StepOutcome::ok().with_output(md_path));
    }
    let line = format!("\t{}", engine.base.md_name);
    engine.log.general(&line);

    // "horizontal/vertical" coordinate system pair.
    let srs_value = match srs.split_once('/') {
        Some((h, v)) => match (h.trim().parse::<i64>(), v.trim().parse::<i64>()) {
            (Ok(h), Ok(v)) => Value::from(vec![h, v]),
            _ => Value::from(srs),
        },
        None => Value::from(srs),
    };
    let args = [
        Value::from(engine.base.geo_path.as_str()),
        Value::from(engine.base.md_name.as_str()),
        srs_value,
        Value::from(num_bands),
        Value::from(pixel_type),
        Value::from(product_definition),
        Value::from(product_band_definitions),
    ];
    engine.call_tool("management.CreateMosaicDataset", &args)?;
    Ok(StepOutcome::ok().with_output(md_path))
}

fn create_geodatabase(engine: &mut Engine) -> bool {
    if engine.base.is_sde {
        return true;
    }
    let workspace = engine.base.workspace.clone();
    if !Path::new(&workspace).exists()
        && let Err(e) = fs::create_dir_all(&workspace)
    {
        engine
            .log
            .critical(&format!("Failed to create folder: {workspace}\n{e}"));
        return false;
    }
    let geo_path = engine.base.geo_path.clone();
    engine
        .log
        .general(&format!("Creating Geodatabase: ({geo_path})"));
    if Path::new(&geo_path).exists() {
        engine
            .log
            .warning("\t000258: File geodatabase already exists!");
        return true;
    }
    let gdb_name = engine.base.gdb_name().to_string();
    match engine.call_tool(
        "management.CreateFileGDB",
        &[Value::from(workspace), Value::from(gdb_name)],
    ) {
        Ok(_) => true,
        Err(e) => {
            engine.log.critical(&format!("\t{e}"));
            false
        }
    }
}

/// CR: one referenced mosaic dataset per source, with its raster functions.
pub fn create_referenced_mosaic_datasets(
    engine: &mut Engine,
    _def: &'static CommandDefinition,
    _step: &CommandStep,
) -> HandlerResult {
    let md_node = mosaic_dataset_node(engine)?;
    let doc = &engine.document;
    let srs = doc.value_of("SRS").trim().to_string();
    let pixel_type = doc.value_of("pixel_type").trim().to_string();
    let ref_md = engine.base.md_name.clone();
    let geo_path = engine.base.geo_path.clone();
    let templates = parameter_dir(engine, RASTER_FUNCTION_TEMPLATES_DIR);

    let mut sources: Vec<String> = Vec::new();
    let mut functions: Vec<String> = Vec::new();
    for &section in doc.children(md_node) {
        match doc.name(section) {
            "AddRasters" => {
                for &add in doc.children(section) {
                    let Some(src) = doc.child(add, "Sources") else {
                        continue;
                    };
                    for &path in doc.children(src) {
                        if !doc.name(path).eq_ignore_ascii_case("data_path") {
                            continue;
                        }
                        for file in doc.text(path).unwrap_or_default().split(';') {
                            let file = file.trim();
                            if file.is_empty() {
                                continue;
                            }
                            let full = if file.contains(['/', '\\']) {
                                file.to_string()
                            } else {
                                join_path(&geo_path, file)
                            };
                            if !sources.iter().any(|s| s.eq_ignore_ascii_case(&full)) {
                                sources.push(full);
                            }
                        }
                    }
                }
            }
            "Functions" => {
                for &f in doc.children(section) {
                    if doc.name(f) != "function_path" {
                        continue;
                    }
                    let raw = doc.text(f).unwrap_or_default().trim().to_string();
                    let prefixed = prefix_folder_path(&raw, Path::new(&templates));
                    functions.push(if Path::new(&prefixed).exists() { prefixed } else { raw });
                }
            }
            _ => {}
        }
    }

    engine.log.general("Creating reference mosaic datasets:");
    let ref_path = join_path(&geo_path, &ref_md);
    for source in &sources {
        engine.log.general(&format!("Creating MD:{ref_md}"));
        if !exists(engine.toolkit.as_mut(), &ref_path) {
            let mut args = vec![
                Value::from(source.as_str()),
                Value::from(ref_path.as_str()),
                Value::from(srs.as_str()),
                Value::from(""),
                Value::from(pixel_type.as_str()),
            ];
            args.extend(std::iter::repeat_n(Value::from(""), 8));
            args.push(Value::from("NO_BOUNDARY"));
            if let Err(e) = engine.call_tool("management.CreateReferencedMosaicDataset", &args) {
                engine
                    .log
                    .warning(&format!("\tFailed to create reference MD {ref_md}: {e}"));
            }
        }
        for (i, function) in functions.iter().enumerate() {
            let name = Path::new(function)
                .file_name()
                .map_or_else(|| function.clone(), |n| n.to_string_lossy().into_owned());
            engine
                .log
                .general(&format!("\t\tAdding raster function: {ref_md}->{name}"));
            let mode = if i == 0 { "REPLACE" } else { "INSERT" };
            if let Err(e) = engine.call_tool(
                "management.EditRasterFunction",
                &[
                    Value::from(ref_path.as_str()),
                    Value::from("EDIT_MOSAIC_DATASET"),
                    Value::from(mode),
                    Value::from(function.as_str()),
                ],
            ) {
                engine
                    .log
                    .warning(&format!("\t\t\tFailed to add raster function {function}: {e}"));
            }
        }
    }
    Ok(StepOutcome::ok())
}

/// AF: fields declared under `Fields/Field`, skipping the ones present.
pub fn add_fields(engine: &mut Engine, _def: &'static CommandDefinition, _step: &CommandStep) -> HandlerResult {
    engine.log.general("Adding custom fields:");
    let line = format!("Using mosaic dataset:{}", engine.base.md_name);
    engine.log.general(&line);

    let Some(fields_node) = engine.document.elements_by_name("Fields").next() else {
        engine
            .log
            .critical("Error: Fields node not found! Invalid schema.");
        return Ok(StepOutcome::failed());
    };
    let mut fields = Vec::new();
    for &field in engine.document.children(fields_node) {
        let doc = &engine.document;
        match (child_text_ci(doc, field, "Name"), child_text_ci(doc, field, "Type")) {
            (Some(name), Some(kind)) => {
                let length = child_text_ci(doc, field, "Length").unwrap_or_default();
                fields.push((name, kind, length));
            }
            _ => {
                engine
                    .log
                    .critical("Error: Number of Field(Name, Type, Len) do not match!");
                return Ok(StepOutcome::failed());
            }
        }
    }

    let md_path = engine.md_path();
    if !exists(engine.toolkit.as_mut(), &md_path) {
        engine.log.warning("Mosaic dataset is not found.");
        return Ok(StepOutcome::failed());
    }
    engine.log.general("\tCreating fields:");
    for (name, kind, length) in fields {
        engine.log.general(&format!("\t\t{name}"));
        if !list_fields(engine.toolkit.as_mut(), &md_path, Some(&name))?.is_empty() {
            continue;
        }
        engine.call_tool(
            "management.AddField",
            &[
                Value::from(md_path.as_str()),
                Value::from(name),
                Value::from(kind),
                Value::from(""),
                Value::from(""),
                Value::from(length),
            ],
        )?;
    }
    Ok(StepOutcome::ok())
}

/// One `AddRaster` entry resolved against the run.
#[derive(Debug, Default)]
struct AddRasterEntry {
    data_path: String,
    raster_type: String,
    filter: String,
    spatial_reference: String,
    dataset_id: String,
}

/// AR: every `AddRasters/AddRaster`; `-s` sources replace the first entry's paths.
pub fn add_rasters(engine: &mut Engine, _def: &'static CommandDefinition, _step: &CommandStep) -> HandlerResult {
    let md_node = mosaic_dataset_node(engine)?;
    let entries = read_add_rasters(engine, md_node);

    engine.log.general("Adding rasters:");
    let md_path = engine.md_path();
    if !exists(engine.toolkit.as_mut(), &md_path) {
        engine
            .log
            .critical(&format!("Error: Path doesn't exist:{md_path}"));
        return Ok(StepOutcome::failed());
    }
    for entry in entries {
        let line = format!(
            "\tUsing mosaic dataset/ID:{}/{}",
            engine.base.md_name, entry.dataset_id
        );
        engine.log.general(&line);
        let line = format!(
            "\tUsing ART for {}: {}",
            engine.base.md_name.to_uppercase(),
            entry.raster_type
        );
        engine.log.general(&line);
        let mut args = vec![
            Value::from(md_path.as_str()),
            Value::from(entry.raster_type),
            Value::from(entry.data_path),
            Value::from("NO_CELL_SIZES"),
            Value::from("NO_BOUNDARY"),
        ];
        args.extend(std::iter::repeat_n(Value::from(""), 4));
        args.push(Value::from(entry.spatial_reference));
        args.push(Value::from(entry.filter));
        if let Err(e) = engine.call_tool("management.AddRastersToMosaicDataset", &args) {
            engine
                .log
                .critical(&format!("Failed to add rasters to mosaic dataset : {md_path}"));
            return Err(e);
        }
    }
    Ok(StepOutcome::ok())
}

fn read_add_rasters(engine: &Engine, md_node: NodeId) -> Vec<AddRasterEntry> {
    let doc = &engine.document;
    let derived = doc.value_of("MosaicDatasetType").trim().eq_ignore_ascii_case("derived");
    let raster_types = parameter_dir(engine, RASTER_TYPE_DIR);
    let override_sources = engine.base.sources.clone();
    let dataset_id = doc.child_text(md_node, "dataset_id").unwrap_or_default();

    let mut entries = Vec::new();
    let Some(section) = doc.child(md_node, "AddRasters") else {
        return entries;
    };
    for &add in doc.children(section) {
        if !doc.name(add).eq_ignore_ascii_case("AddRaster") {
            continue;
        }
        if !override_sources.is_empty() && !entries.is_empty() {
            break;
        }
        let mut entry = AddRasterEntry {
            raster_type: "Raster Dataset".to_string(),
            dataset_id: dataset_id.clone(),
            ..Default::default()
        };
        for &field in doc.children(add) {
            let value = doc.text(field).unwrap_or_default().trim().to_string();
            match doc.name(field).to_lowercase().as_str() {
                "sources" if override_sources.is_empty() => {
                    let mut paths = Vec::new();
                    for &p in doc.children(field) {
                        if !doc.name(p).eq_ignore_ascii_case("data_path") {
                            continue;
                        }
                        let file = doc.text(p).unwrap_or_default().trim().to_string();
                        if derived && !file.contains(['/', '\\']) {
                            paths.extend(
                                file.split(';')
                                    .filter(|f| !f.is_empty())
                                    .map(|f| join_path(&engine.base.geo_path, f)),
                            );
                        } else if !file.is_empty() {
                            paths.push(file);
                        }
                    }
                    entry.data_path = paths.join(";");
                }
                "sources" => entry.data_path = override_sources.clone(),
                "raster_type" => {
                    entry.raster_type = if value.to_lowercase().contains("art.xml") {
                        prefix_folder_path(&value, Path::new(&raster_types))
                    } else {
                        value
                    };
                }
                "filter" => entry.filter = if value == "*" { String::new() } else { value },
                "spatial_reference" => entry.spatial_reference = value,
                "dataset_id" => entry.dataset_id = value,
                _ => {}
            }
        }
        entries.push(entry);
    }
    entries
}

/// SP: `DefaultProperties` values matched to the tool's parameter names.
pub fn set_properties(engine: &mut Engine, def: &'static CommandDefinition, _step: &CommandStep) -> HandlerResult {
    const FUNCTION: &str = "management.SetMosaicDatasetProperties";
    engine.describe(def);
    let md_node = mosaic_dataset_node(engine)?;
    let templates = parameter_dir(engine, RASTER_FUNCTION_TEMPLATES_DIR);

    let mut properties: Vec<(String, String)> = Vec::new();
    if let Some(defaults) = engine.document.child(md_node, "DefaultProperties") {
        for &p in engine.document.children(defaults) {
            let name = engine.document.name(p).to_string();
            let mut value = engine.document.text(p).unwrap_or_default().trim().to_string();
            if matches!(name.as_str(), "processing_templates" | "default_processing_template")
                && value != DEFAULT_MARKER
                && !value.is_empty()
            {
                value = value
                    .split(';')
                    .map(|each| {
                        if each.contains('/') || each.eq_ignore_ascii_case("none") {
                            each.to_string()
                        } else {
                            join_path(&templates, each)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(";");
            }
            properties.push((name.to_lowercase(), value));
        }
    }

    let Some(signature) = engine.toolkit.resolve(FUNCTION) else {
        engine
            .log
            .critical(&format!("Unable to resolve ({FUNCTION}) in the toolkit."));
        return Ok(StepOutcome::failed());
    };
    let mut args = vec![Value::from(engine.md_path())];
    for param in signature.params.iter().skip(1) {
        let value = properties
            .iter()
            .find(|(k, _)| *k == param.to_lowercase())
            .map_or(DEFAULT_MARKER, |(_, v)| v.as_str());
        args.push(Value::from(value));
    }
    Ok(invoke_with_args(engine, FUNCTION, args))
}

// --- Footprints, seamlines and layer-scoped edits ---

/// BF: footprints of the new rows, narrowed by an optional `where_clause`.
pub fn build_footprints(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let line = format!("\tRecomputing footprint for the mosaic dataset: {}", engine.base.md_name);
    engine.log.general(&line);
    let query = engine.param(def.process_key, "where_clause", step.index)?;
    let mut expression = new_rows_expression(engine);
    if !query.is_empty() && query != DEFAULT_MARKER {
        expression.push_str(&format!(" AND {query}"));
    }
    let mut args = vec![Value::from(engine.md_path()), Value::from(expression)];
    args.extend(params(
        engine,
        def,
        &[
            "reset_footprint",
            "min_data_value",
            "max_data_value",
            "approx_num_vertices",
            "shrink_distance",
            "maintain_edges",
            "skip_derived_images",
            "update_boundary",
            "request_size",
            "min_region_size",
            "simplification_method",
            "edge_tolerance",
            "max_sliver_size",
            "min_thinness_ratio",
        ],
        step.index,
    )?);
    Ok(invoke_with_args(engine, "management.BuildFootprints", args))
}

/// BS
pub fn build_seamlines(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let line = format!("\tBuild Seamline for the mosaic dataset: {}", engine.base.md_name);
    engine.log.general(&line);
    let mut args = vec![Value::from(engine.md_path())];
    args.extend(params(
        engine,
        def,
        &[
            "cell_size",
            "sort_method",
            "sort_order",
            "order_by_attribute",
            "order_by_base_value",
            "view_point",
            "computation_method",
            "blend_width",
            "blend_type",
            "request_size",
            "request_size_type",
            "blend_width_units",
            "area_of_interest",
            "where_clause",
            "update_existing",
        ],
        step.index,
    )?);
    Ok(invoke_with_args(engine, "management.BuildSeamlines", args))
}

/// BPS
pub fn build_pyramids_and_statistics(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.describe(def);
    let args = params(
        engine,
        def,
        &[
            "include_subdirectories",
            "build_pyramids",
            "calculate_statistics",
            "build_on_source",
            "block_field",
            "estimate_statistics",
            "x_skip_factor",
            "y_skip_factor",
            "ignore_values",
            "pyramid_level",
            "skip_first",
            "resample_technique",
            "compression_type",
            "compression_quality",
            "skip_existing",
        ],
        step.index,
    )?;
    on_new_rows_layer(engine, "management.BuildPyramidsandStatistics", args)
}

/// ERF: a bare `.rft` name resolves to the raster function templates folder.
pub fn edit_raster_function(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    engine.describe(def);
    let mut template = engine.param(def.process_key, "function_chain_definition", step.index)?;
    if is_bare_file(&template, ".rft") {
        template = join_path(&parameter_dir(engine, RASTER_FUNCTION_TEMPLATES_DIR), &template);
    }
    let args = vec![
        engine.param_value(def.process_key, "edit_mosaic_dataset_item", step.index)?,
        engine.param_value(def.process_key, "edit_options", step.index)?,
        Value::from(template),
        engine.param_value(def.process_key, "location_function_name", step.index)?,
    ];
    on_new_rows_layer(engine, "management.EditRasterFunction", args)
}

/// DN
pub fn define_nodata(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    engine.describe(def);
    let args = params(
        engine,
        def,
        &[
            "num_bands",
            "bands_for_nodata_value",
            "bands_for_valid_data_range",
            "where_clause",
            "composite_nodata_value",
        ],
        step.index,
    )?;
    on_new_rows_layer(engine, "management.DefineMosaicDatasetNoData", args)
}

// --- Geometry, fields and statistics ---

/// IG: `<name>.gdb\<fc>` paths resolve under the parameter folder.
pub fn import_geometry(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    engine.describe(def);
    let mut import_path = engine.param(def.process_key, "input_featureclass", step.index)?;
    let lower = import_path.to_lowercase();
    let gdb_at = lower.find(".gdb\\").or_else(|| lower.find(".gdb/"));
    let first_sep = import_path.find(['\\', '/']);
    if let (Some(at), Some(sep)) = (gdb_at, first_sep)
        && sep == at + GEODATABASE_EXT.len()
    {
        import_path = join_path(&parameter_dir(engine, IMPORT_GEOMETRY_DIR), &import_path.replace('\\', "/"));
    }
    let args = vec![
        Value::from(engine.md_path()),
        engine.param_value(def.process_key, "target_featureclass_type", step.index)?,
        engine.param_value(def.process_key, "target_join_field", step.index)?,
        Value::from(import_path),
        engine.param_value(def.process_key, "input_join_field", step.index)?,
    ];
    engine.call_tool("management.ImportMosaicDatasetGeometry", &args)?;
    Ok(StepOutcome::ok())
}

/// IF: joins a configuration table to the footprints and copies its fields.
pub fn import_field_values(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    const KEEP: &[&str] = &["Comments", "OBJECTID", "Dataset_ID"];
    engine.describe(def);
    let md_path = engine.md_path();
    let join_table = engine.param(def.process_key, "input_featureclass", step.index)?;
    let table_name = join_table
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(&join_table)
        .to_string();
    let join_fields = list_fields(engine.toolkit.as_mut(), &join_table, None)?;
    engine.log.general(&join_fields.join(", "));

    let layer = format!("{}layer0", engine.base.md_name);
    engine.call_tool(
        TOOL_MAKE_MOSAIC_LAYER,
        &[Value::from(md_path.as_str()), Value::from(layer.as_str())],
    )?;
    engine
        .log
        .general("Joining the mosaic dataset layer with the configuration table");
    let joined = engine.call_tool(
        "management.AddJoin",
        &[
            Value::from(format!("{layer}/Footprint")),
            engine.param_value(def.process_key, "input_join_field", step.index)?,
            Value::from(join_table.as_str()),
            engine.param_value(def.process_key, "target_join_field", step.index)?,
            Value::from("KEEP_ALL"),
        ],
    )?;
    for field in join_fields {
        if KEEP.contains(&field.as_str()) {
            engine
                .log
                .general(&format!("\t\tvalues exist for the field : {field}"));
            continue;
        }
        let target = format!("AMD_{}_CAT.{field}", engine.base.md_name);
        let source = format!("[{table_name}.{field}]");
        match engine.call_tool(
            "management.CalculateField",
            &[joined.clone(), Value::from(target.as_str()), Value::from(source)],
        ) {
            Ok(_) => engine
                .log
                .general(&format!("\t\tDone calculating values for the Field :{target}")),
            Err(e) => {
                engine
                    .log
                    .warning(&format!("Failed to calculate values for the field : {target}"));
                engine.log.warning(&e.to_string());
            }
        }
    }
    Ok(StepOutcome::ok())
}

/// SS: a stats file name resolves under the statistics folder.
pub fn set_statistics(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let md_path = engine.md_path();
    engine
        .log
        .general(&format!("Setting MD statistics for:{md_path}"));
    let mut stats_file = engine.param(def.process_key, "stats_file", step.index)?;
    if !stats_file.is_empty() && stats_file != DEFAULT_MARKER {
        stats_file = prefix_folder_path(&stats_file, Path::new(&parameter_dir(engine, STATISTICS_DIR)));
    }
    let args = vec![
        Value::from(md_path),
        engine.param_value(def.process_key, "data_type", step.index)?,
        engine.param_value(def.process_key, "statistics", step.index)?,
        Value::from(stats_file),
        engine.param_value(def.process_key, "nodata", step.index)?,
    ];
    engine.call_tool("management.SetRasterProperties", &args)?;
    Ok(StepOutcome::ok())
}

/// AI: one index per `AddIndex/Index` sub-record.
pub fn add_index(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let md_path = engine.md_path();
    engine.log.general(&format!("Adding Index:{md_path}"));
    let count = engine.process_info.items(def.process_key, step.index)?.len();
    let mut failed = false;
    for sub in 0..count {
        let value = |key: &str| -> Result<Value, EngineError> {
            Ok(Value::from(
                engine
                    .process_info
                    .value_of(def.process_key, key, step.index, Some(sub))?,
            ))
        };
        let args = [
            Value::from(md_path.as_str()),
            value("fields")?,
            value("index_name")?,
            value("unique")?,
            value("ascending")?,
        ];
        if let Err(e) = engine.call_tool("management.AddIndex", &args) {
            engine.log.critical(&e.to_string());
            failed = true;
        }
    }
    Ok(StepOutcome::from_status(!failed))
}

/// CV: one field calculation per `CalculateValues/CalculateValue` sub-record,
/// each on its own selection layer.
pub fn calculate_values(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let md_path = engine.md_path();
    let count = engine.process_info.items(def.process_key, step.index)?.len();
    engine.log.general(&format!("Calculate values:{md_path}"));
    let mut failed = false;
    for sub in 0..count {
        let value = |key: &str| -> Result<String, EngineError> {
            Ok(engine
                .process_info
                .value_of(def.process_key, key, step.index, Some(sub))?)
        };
        let query = value("query")?;
        let args = [
            value("fieldname")?,
            value("expression")?,
            value("expression_type")?,
            value("code_block")?,
        ];
        let layer = format!(
            "lyr_{}_{}",
            engine.base.last_object_id,
            Local::now().format(LAYER_STAMP_FORMAT)
        );
        let mut expression = new_rows_expression(engine);
        if query != DEFAULT_MARKER {
            expression.push_str(&format!(" AND {query}"));
        }

        let calculated = engine
            .call_tool(
                TOOL_MAKE_MOSAIC_LAYER,
                &[Value::from(md_path.as_str()), Value::from(layer.as_str())],
            )
            .and_then(|_| {
                engine.call_tool(
                    "management.SelectLayerByAttribute",
                    &[
                        Value::from(layer.as_str()),
                        Value::from("NEW_SELECTION"),
                        Value::from(expression),
                    ],
                )
            })
            .and_then(|_| {
                let mut call_args = vec![Value::from(layer.as_str())];
                call_args.extend(args.iter().map(|a| Value::from(a.as_str())));
                engine.call_tool("management.CalculateField", &call_args)
            });
        if let Err(e) = calculated {
            engine.log.critical(&e.to_string());
            failed = true;
        }
        if let Err(e) = engine.call_tool(TOOL_DELETE, &[Value::from(layer)]) {
            engine.log.critical(&e.to_string());
            failed = true;
        }
    }
    Ok(StepOutcome::from_status(!failed))
}

/// CFC: exports the seamlines as a feature class carrying the catalog fields.
pub fn cache_feature_class(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    const SEAMLINE_ONLY_FIELDS: &[&str] = &["BlendWidthUnits", "BlendType", "BlendWidth", "ItemHash"];
    const CATALOG_SYSTEM_FIELDS: &[&str] = &[
        "OBJECTID",
        "Shape",
        "Raster",
        "MinPS",
        "MaxPS",
        "HighPS",
        "Category",
        "Tag",
        "GroupName",
        "ProductName",
        "CenterX",
        "CenterY",
        "ZOrder",
        "TypeID",
        "ItemTS",
        "UriHash",
        "Uri",
        "Shape_Length",
        "Shape_Area",
        "SOrder",
        "SLevelPS",
    ];

    let md_path = engine.md_path();
    let seamlines = join_path(&engine.base.geo_path, &format!("AMD_{}_SML", engine.base.md_name));
    if !exists(engine.toolkit.as_mut(), &seamlines) {
        engine.log.general(&format!(
            "Seamline does not exist for the mosaic dataset: {md_path}"
        ));
        return Ok(StepOutcome::failed());
    }

    let mut output = engine
        .param(def.process_key, "out_cache_featureclass", step.index)?
        .replace('\\', "/");
    if !output.contains('/') {
        output = join_path(&engine.base.geo_path, &output);
    }
    if exists(engine.toolkit.as_mut(), &output) {
        engine
            .log
            .critical(&format!("Output cache feature class already exists: {output}"));
        return Ok(StepOutcome::failed());
    }
    let (out_workspace, out_name) = output.rsplit_once('/').unwrap_or(("", output.as_str()));
    engine
        .log
        .general(&format!("Exporting seamline as a feature class: {output}"));
    if let Err(e) = engine.call_tool(
        "conversion.FeatureClassToFeatureClass",
        &[
            Value::from(seamlines.as_str()),
            Value::from(out_workspace),
            Value::from(out_name),
            Value::from(DEFAULT_MARKER),
            Value::from(DEFAULT_MARKER),
            Value::from(DEFAULT_MARKER),
        ],
    ) {
        engine.log.critical(&format!(
            "Failed to create the output feature class ({output}): ({e})"
        ));
        return Ok(StepOutcome::failed());
    }

    let present = list_fields(engine.toolkit.as_mut(), &seamlines, None)?;
    let drop: Vec<Value> = SEAMLINE_ONLY_FIELDS
        .iter()
        .filter(|f| present.iter().any(|p| p.eq_ignore_ascii_case(f)))
        .map(|f| Value::from(*f))
        .collect();
    if !drop.is_empty()
        && let Err(e) = engine.call_tool(
            "management.DeleteField",
            &[Value::from(output.as_str()), Value::Array(drop)],
        )
    {
        engine
            .log
            .critical(&format!("Failed to delete the fields: {e}"));
    }

    let import: Vec<Value> = list_fields(engine.toolkit.as_mut(), &md_path, None)?
        .into_iter()
        .filter(|f| !CATALOG_SYSTEM_FIELDS.contains(&f.as_str()))
        .map(Value::from)
        .collect();
    if let Err(e) = engine.call_tool(
        "management.JoinField",
        &[
            Value::from(output.as_str()),
            Value::from("RasterID"),
            Value::from(md_path),
            Value::from("OBJECTID"),
            Value::Array(import),
        ],
    ) {
        engine
            .log
            .critical(&format!("Failed to import metadata fields:{e}"));
        return Ok(StepOutcome::failed());
    }
    Ok(StepOutcome::ok())
}

// --- Workspace ---

/// CP
pub fn compact(engine: &mut Engine, _def: &'static CommandDefinition, _step: &CommandStep) -> HandlerResult {
    let geo_path = engine.base.geo_path.clone();
    if !engine.base.is_sde && Path::new(&geo_path).exists() {
        match wait_for_lock_release(Path::new(&geo_path)) {
            Ok(LockWait::Released { .. }) => {}
            Ok(LockWait::TimedOut) => engine.log.warning("lock file release timed out!"),
            Err(e) => engine.log.warning(&e.to_string()),
        }
    }
    engine
        .log
        .general(&format!("Compacting file geodatabase:{geo_path}"));
    engine.call_tool("management.Compact", &[Value::from(geo_path)])?;
    Ok(StepOutcome::ok())
}

/// SE: applies the n-th `Environment` section to the toolkit.
pub fn set_environment(engine: &mut Engine, _def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    const SKIPPED: &[&str] = &["ClearEnvironment", "ResetEnvironments"];
    engine.log.general(&format!(
        "Set environment variables on index: {}",
        step.index
    ));
    let Some(section) = engine.document.elements_by_name("Environment").nth(step.index) else {
        engine.log.warning(&format!(
            "No environment variables could be found/at index ({})",
            step.index
        ));
        return Ok(StepOutcome::failed());
    };

    let doc = &engine.document;
    let mut settings = Vec::new();
    for &child in doc.children(section) {
        let key = doc.name(child).to_string();
        if SKIPPED.contains(&key.as_str()) {
            continue;
        }
        let value = if doc.children(child).is_empty() {
            doc.text(child).unwrap_or_default().trim().to_string()
        } else {
            doc.children(child)
                .iter()
                .map(|&c| doc.text(c).unwrap_or_default().trim())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string()
        };
        if value.is_empty() || value == DEFAULT_MARKER {
            continue;
        }
        settings.push((key, value));
    }

    for (key, value) in settings {
        match engine.toolkit.set_environment(&key, &value) {
            Ok(()) => engine.log.general(&format!("Env[{key}]={value}")),
            Err(e) => engine.log.warning(&e.to_string()),
        }
    }
    Ok(StepOutcome::ok())
}

// --- Tile caches and packages ---

/// MTC: a relative tiling scheme resolves next to the configuration file.
pub fn manage_tile_cache(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let md_path = engine.md_path();
    engine.log.general(&format!("Building cache for:{md_path}"));
    engine.log.general("Getting tiling Schema : ");
    let mut scheme = engine.param(def.process_key, "import_tiling_scheme", step.index)?;
    if !scheme.is_empty()
        && scheme != DEFAULT_MARKER
        && let Some(config_dir) = engine.document.source_path().and_then(Path::parent)
    {
        scheme = prefix_folder_path(&scheme, config_dir);
    }
    engine.log.general(&scheme);

    let location = engine.param(def.process_key, "in_cache_location", step.index)?;
    if !Path::new(&location).exists() {
        fs::create_dir_all(&location).map_err(|source| EngineError::Io {
            path: location.clone().into(),
            source,
        })?;
    }
    let key = def.process_key;
    let i = step.index;
    let args = vec![
        Value::from(location),
        engine.param_value(key, "manage_mode", i)?,
        engine.param_value(key, "in_cache_name", i)?,
        Value::from(md_path),
        engine.param_value(key, "tiling_scheme", i)?,
        Value::from(scheme),
        engine.param_value(key, "scales", i)?,
        engine.param_value(key, "area_of_interest", i)?,
        engine.param_value(key, "max_cell_size", i)?,
        engine.param_value(key, "min_cached_scale", i)?,
        engine.param_value(key, "max_cached_scale", i)?,
    ];
    engine.call_tool("management.ManageTileCache", &args)?;
    Ok(StepOutcome::ok())
}

/// ETC: the target folder is created first.
pub fn export_tile_cache(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    let key = def.process_key;
    let i = step.index;
    let name = engine.param(key, "in_target_cache_name", i)?;
    engine.log.general(&format!("Exporting cache for:{name}"));
    let target = engine.param(key, "in_target_cache_folder", i)?;
    fs::create_dir_all(&target).map_err(|source| EngineError::Io {
        path: target.clone().into(),
        source,
    })?;
    let args = vec![
        engine.param_value(key, "in_cache_source", i)?,
        Value::from(target),
        Value::from(name),
        engine.param_value(key, "export_cache_type", i)?,
        engine.param_value(key, "storage_format_type", i)?,
        engine.param_value(key, "scales", i)?,
        engine.param_value(key, "area_of_interest", i)?,
    ];
    engine.call_tool("management.ExportTileCache", &args)?;
    Ok(StepOutcome::ok())
}

/// CPCSLP: the output coordinate system is a well-known id.
pub fn create_point_cloud_scene_layer_package(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.log.general(&format!("\t{}", def.desc));
    let key = def.process_key;
    let i = step.index;
    let wkid_text = engine.param(key, "out_coor_system", i)?;
    let wkid: i64 = wkid_text.trim().parse().map_err(|_| {
        EngineError::Step(format!("Invalid out_coor_system ({wkid_text}), a numeric id is expected."))
    })?;
    let args = vec![
        engine.param_value(key, "in_dataset", i)?,
        engine.param_value(key, "out_slpk", i)?,
        Value::from(wkid),
        Value::Null,
        engine.param_value(key, "attributes", i)?,
        engine.param_value(key, "point_size_m", i)?,
        engine.param_value(key, "xy_max_error_m", i)?,
        engine.param_value(key, "z_max_error_m", i)?,
        Value::Null,
        engine.param_value(key, "scene_layer_version", i)?,
    ];
    engine.call_tool("management.CreatePointCloudSceneLayerPackage", &args)?;
    Ok(StepOutcome::ok())
}

/// RR: the whole dataset, or each row matching the configured query.
pub fn register_raster(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    const FUNCTION: &str = "management.RegisterRaster";
    engine.describe(def);
    let md_path = engine.md_path();
    let mut query = engine.document.value_at_path(XPATH_REGISTER_RASTER_QUERY);
    if query.is_empty() {
        query = DEFAULT_MARKER.to_string();
    }
    if query == DEFAULT_MARKER {
        return engine.invoke_dynamic(def.process_key, FUNCTION, vec![Value::from(md_path)], step.index, false);
    }

    let rows = engine.call_tool(
        TOOL_SEARCH_ROWS,
        &[
            Value::from(md_path.as_str()),
            Value::from(vec!["OBJECTID", "Name"]),
            Value::from(query),
        ],
    )?;
    for row in rows.as_array().map_or(&[][..], Vec::as_slice) {
        let cells = row.as_array().map_or(&[][..], Vec::as_slice);
        let oid = cells.first().map_or_else(String::new, |v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let name = cells
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let item = join_path(&md_path, &format!("OBJECTID={oid}"));
        match engine.invoke_dynamic(def.process_key, FUNCTION, vec![Value::from(item)], step.index, false) {
            Ok(outcome) if outcome.status() => engine.log.general(&format!("Successful for {name}")),
            Ok(_) => engine.log.critical(&format!("Failed for {name}")),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => engine.log.critical(&format!("Failed for {name}...{e}")),
        }
    }
    Ok(StepOutcome::ok())
}

// --- Deep learning ---

/// Input raster (the dataset when unset) and output (`<md path><process key>` when unset).
fn deep_learning_io(
    engine: &Engine,
    def: &CommandDefinition,
    output_key: &str,
    index: usize,
) -> Result<(String, String), EngineError> {
    let md_path = engine.md_path();
    let mut input = engine.param(def.process_key, "in_raster", index)?;
    let mut output = engine.param(def.process_key, output_key, index)?;
    if input == DEFAULT_MARKER {
        input = md_path.clone();
    }
    if output == DEFAULT_MARKER {
        output = format!("{md_path}{}", def.process_key);
    }
    Ok((input, output))
}

fn model_path(engine: &Engine, def: &CommandDefinition, index: usize) -> Result<Value, EngineError> {
    let model = engine.param(def.process_key, "in_model_definition", index)?;
    Ok(Value::from(join_path(
        &parameter_dir(engine, DEEP_LEARNING_PACKAGES_DIR),
        &model,
    )))
}

/// CPUDL: classifies, then saves the returned raster to the output path.
pub fn classify_pixels_using_deep_learning(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.describe(def);
    let (input, output) = deep_learning_io(engine, def, "out_classified_raster", step.index)?;
    let args = vec![
        Value::from(input),
        model_path(engine, def, step.index)?,
        engine.param_value(def.process_key, "arguments", step.index)?,
        engine.param_value(def.process_key, "processing_mode", step.index)?,
    ];
    let raster = engine.call_tool("ia.ClassifyPixelsUsingDeepLearning", &args)?;
    match engine
        .toolkit
        .call_method(&raster, "save", &[Value::from(output.as_str())])?
    {
        Some(_) => Ok(StepOutcome::ok().with_output(output)),
        None => Err(EngineError::Step(
            "Classified raster could not be saved.".to_string(),
        )),
    }
}

/// DOUDL
pub fn detect_objects_using_deep_learning(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.describe(def);
    let i = step.index;
    let (input, output) = deep_learning_io(engine, def, "out_detected_objects", i)?;
    let mut args = vec![Value::from(input), Value::from(output), model_path(engine, def, i)?];
    args.extend(params(
        engine,
        def,
        &[
            "arguments",
            "run_nms",
            "confidence_score_field",
            "class_value_field",
            "max_overlap_ratio",
            "processing_mode",
        ],
        i,
    )?);
    engine.invoke_dynamic(def.process_key, "ia.DetectObjectsUsingDeepLearning", args, i, false)
}

/// COUDL
pub fn classify_objects_using_deep_learning(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.describe(def);
    let i = step.index;
    let (input, output) = deep_learning_io(engine, def, "out_feature_class", i)?;
    let mut args = vec![Value::from(input), Value::from(output), model_path(engine, def, i)?];
    args.extend(params(
        engine,
        def,
        &["in_features", "class_label_field", "processing_mode", "model_arguments"],
        i,
    )?);
    engine.invoke_dynamic(def.process_key, "ia.ClassifyObjectsUsingDeepLearning", args, i, false)
}

/// EFUAIM: output location and prefix default like the other deep learning outputs.
pub fn extract_features_using_ai_models(
    engine: &mut Engine,
    def: &'static CommandDefinition,
    step: &CommandStep,
) -> HandlerResult {
    engine.describe(def);
    let i = step.index;
    let (input, output) = deep_learning_io(engine, def, "out_location", i)?;
    let mut prefix = engine.param(def.process_key, "out_prefix", i)?;
    if prefix == DEFAULT_MARKER {
        prefix = format!("{}{}", engine.md_path(), def.process_key);
    }
    let mut args = vec![
        Value::from(input),
        engine.param_value(def.process_key, "mode", i)?,
        Value::from(output),
        Value::from(prefix),
    ];
    args.extend(params(
        engine,
        def,
        &[
            "area_of_interest",
            "pretrained_models",
            "additional_models",
            "confidence_threshold",
            "save_intermediate_output",
            "test_time_augmentation",
            "buffer_distance",
            "extend_length",
            "smoothing_tolerance",
            "dangle_length",
            "in_road_features",
            "road_buffer_width",
            "regularize_parcels",
            "post_processing_workflow",
            "out_features",
            "parcel_tolerance",
            "regularization_method",
            "poly_tolerance",
        ],
        i,
    )?);
    engine.invoke_dynamic(def.process_key, "geoai.ExtractFeaturesUsingAIModels", args, i, false)
}

// --- Files ---

/// TF: bare `.acs` connection file names resolve to the ACS files folder.
pub fn transfer_files(engine: &mut Engine, def: &'static CommandDefinition, step: &CommandStep) -> HandlerResult {
    engine.describe(def);
    let acs_dir = parameter_dir(engine, ACS_FILES_DIR);
    let resolve = |path: &str| {
        if is_bare_file(path, ".acs") {
            join_path(&acs_dir, path)
        } else {
            path.to_string()
        }
    };
    let inputs = engine.param(def.process_key, "input_paths", step.index)?;
    let inputs = inputs.split(';').map(resolve).collect::<Vec<_>>().join(";");
    let output = resolve(&engine.param(def.process_key, "output_folder", step.index)?);
    let args = vec![
        Value::from(inputs),
        Value::from(output),
        engine.param_value(def.process_key, "file_filter", step.index)?,
    ];
    engine.invoke_dynamic(def.process_key, "management.TransferFiles", args, step.index, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{EngineOptions, UnresolvedPolicy};
    use crate::core::run_log::RunLog;
    use crate::core::toolkit::{RecordingToolkit, TOOL_EXISTS, TOOL_LIST_FIELDS};
    use crate::core::user_code::NoUserCode;
    use serde_json::json;

    const CONFIG: &str = r#"<Application>
  <Workspace>
    <WorkspacePath>/data/ws</WorkspacePath>
    <Geodatabase>imagery.gdb</Geodatabase>
    <MosaicDataset>
      <Name>md</Name>
      <SRS>4326/5773</SRS>
      <Environment>
        <parallelProcessingFactor>80%</parallelProcessingFactor>
        <scratchWorkspace>#</scratchWorkspace>
        <ClearEnvironment>true</ClearEnvironment>
        <extent><XMin>1</XMin><YMin>2</YMin></extent>
      </Environment>
      <Processes>
        <BuildFootprint><where_clause>Year = 2020</where_clause></BuildFootprint>
        <AddIndex>
          <Index><fields>Name</fields><index_name>idx1</index_name></Index>
          <Index><fields>Year</fields><index_name>idx2</index_name></Index>
        </AddIndex>
        <EditRasterFunction><function_chain_definition>hillshade.rft</function_chain_definition></EditRasterFunction>
        <TransferFiles><input_paths>src.acs;/data/in</input_paths><output_folder>/data/out</output_folder></TransferFiles>
        <ClassifyPixelsUsingDeepLearning><in_model_definition>trees.dlpk</in_model_definition></ClassifyPixelsUsingDeepLearning>
      </Processes>
    </MosaicDataset>
  </Workspace>
</Application>"#;

    fn engine(toolkit: RecordingToolkit) -> Engine {
        let doc = Document::parse(CONFIG).unwrap();
        let options = EngineOptions {
            root: "/mdcs".into(),
            unresolved: UnresolvedPolicy::Skip,
            ..Default::default()
        };
        Engine::new(doc, Box::new(toolkit), Box::new(NoUserCode), RunLog::new("MDCS"), options).unwrap()
    }

    #[test]
    fn test_layer_stamp_repeats_the_day() {
        let at = chrono::NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(8, 9, 10)
            .unwrap();
        let stamp = at.format(LAYER_STAMP_FORMAT).to_string();
        assert!(stamp.starts_with("20240707080910"));
    }

    #[test]
    fn test_build_footprints_narrows_to_new_rows() {
        let handle = RecordingToolkit::new().with_tool(
            "management.BuildFootprints",
            &["in_mosaic_dataset", "where_clause", "reset_footprint"],
        );
        let mut engine = engine(handle.clone());
        let results = engine.run("BF").unwrap();
        assert!(results[0].value);
        let call = handle.calls().pop().unwrap();
        assert_eq!(call.args.len(), 3);
        assert_eq!(call.args[0], json!("/data/ws/imagery.gdb/md"));
        assert_eq!(call.args[1], json!("OBJECTID >0 AND Year = 2020"));
    }

    #[test]
    fn test_add_index_iterates_sub_records() {
        let handle = RecordingToolkit::new();
        let mut engine = engine(handle.clone());
        assert!(engine.run("AI").unwrap()[0].value);
        let calls: Vec<_> = handle
            .calls()
            .into_iter()
            .filter(|c| c.name == "management.AddIndex")
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].args[1], json!("Year"));
        assert_eq!(calls[1].args[2], json!("idx2"));
        assert_eq!(calls[1].args[3], json!("#"));
    }

    #[test]
    fn test_set_environment_flattens_nested_values() {
        let handle = RecordingToolkit::new();
        let mut engine = engine(handle.clone());
        assert!(engine.run("SE").unwrap()[0].value);
        assert_eq!(
            handle.environment(),
            vec![
                ("parallelProcessingFactor".to_string(), "80%".to_string()),
                ("extent".to_string(), "1 2".to_string()),
            ]
        );
        assert!(!engine.run("SE").is_err());
        assert!(!engine.run("SE1").unwrap()[0].value);
    }

    #[test]
    fn test_layer_scoped_edit_resolves_template_and_cleans_up() {
        let handle = RecordingToolkit::new();
        let mut engine = engine(handle.clone());
        assert!(engine.run("ERF").unwrap()[0].value);
        assert_eq!(
            handle.call_names(),
            vec![TOOL_MAKE_MOSAIC_LAYER, "management.EditRasterFunction", TOOL_DELETE]
        );
        let edit = &handle.calls()[1];
        assert_eq!(edit.args[0], json!("lyr_0"));
        assert_eq!(edit.args[3], json!("/mdcs/Parameter/RasterFunctionTemplates/hillshade.rft"));
    }

    #[test]
    fn test_layer_is_deleted_when_call_fails() {
        let handle = RecordingToolkit::new().failing("management.DefineMosaicDatasetNoData");
        let mut engine = engine(handle.clone());
        assert!(!engine.run("DN").unwrap()[0].value);
        assert_eq!(handle.call_names().last().unwrap(), TOOL_DELETE);
    }

    #[test]
    fn test_transfer_files_resolves_bare_connection_files() {
        let handle = RecordingToolkit::new().with_tool(
            "management.TransferFiles",
            &["input_paths", "output_folder", "file_filter"],
        );
        let mut engine = engine(handle.clone());
        assert!(engine.run("TF").unwrap()[0].value);
        let call = handle.calls().pop().unwrap();
        assert_eq!(call.args[0], json!("/mdcs/Parameter/ACSFiles/src.acs;/data/in"));
        assert_eq!(call.args[2], Value::Null);
    }

    #[test]
    fn test_classify_pixels_saves_result() {
        let handle = RecordingToolkit::new()
            .with_result("ia.ClassifyPixelsUsingDeepLearning", json!({"raster": "tmp"}))
            .with_method_result("save", json!(true));
        let mut engine = engine(handle.clone());
        let results = engine.run("CPUDL").unwrap();
        assert!(results[0].value);
        assert_eq!(
            results[0].output,
            Some(json!("/data/ws/imagery.gdb/mdclassifypixelsusingdeeplearning"))
        );
        let classify = &handle.calls()[0];
        assert_eq!(classify.args[1], json!("/mdcs/Parameter/DLPKpackages/trees.dlpk"));
    }

    #[test]
    fn test_add_fields_requires_fields_section() {
        let handle = RecordingToolkit::new().with_result(TOOL_EXISTS, json!(true));
        let mut engine = engine(handle.clone());
        assert!(!engine.run("AF").unwrap()[0].value);
        assert!(
            engine
                .log()
                .messages()
                .contains(&"Error: Fields node not found! Invalid schema.".to_string())
        );
    }

    #[test]
    fn test_cache_feature_class_requires_seamlines() {
        let handle = RecordingToolkit::new().with_result(TOOL_LIST_FIELDS, json!([]));
        let mut engine = engine(handle);
        assert!(!engine.run("CFC").unwrap()[0].value);
    }

    #[test]
    fn test_create_mosaic_dataset_passes_coordinate_pair() {
        let handle = RecordingToolkit::new();
        let mut engine = engine(handle.clone());
        engine.base.is_sde = true;
        let results = engine.run("CM").unwrap();
        assert!(results[0].value);
        assert_eq!(results[0].output, Some(json!("/data/ws/imagery.gdb/md")));
        let create = handle
            .calls()
            .into_iter()
            .find(|c| c.name == "management.CreateMosaicDataset")
            .unwrap();
        assert_eq!(create.args[2], json!([4326, 5773]));
    }
}
