//! Read-only queries over the mirror.

use crate::cli::commands::{format_millis, open_storage};
use crate::cli::{Entity, PageArgs};
use crate::error::{Error, Result};
use crate::model::is_part_studio;
use crate::storage::{Document, Element, Feature, Part, Workspace};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct ListOutput<'a, T> {
    count: usize,
    items: &'a [T],
}

fn print_json_list<T: Serialize>(items: &[T]) -> Result<()> {
    let output = ListOutput {
        count: items.len(),
        items,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// List mirrored documents.
///
/// # Errors
///
/// Returns an error if the database is missing or the query fails.
pub fn documents(page: PageArgs, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let docs = storage.list_documents(page.limit, page.offset)?;

    if crate::is_csv() {
        println!("document_id,name,owner,public");
        for d in &docs {
            println!(
                "{},{},{},{}",
                d.document_id,
                crate::csv_escape(&d.name),
                crate::csv_escape(d.owner_name.as_deref().unwrap_or("")),
                d.public
            );
        }
    } else if json {
        print_json_list(&docs)?;
    } else if docs.is_empty() {
        println!("No documents mirrored. Run 'cm sync documents' first.");
    } else {
        println!("Documents ({} shown):", docs.len());
        for d in &docs {
            println!("  {}  {}  [{}]", d.document_id, d.name, or_dash(d.owner_name.as_deref()));
        }
    }
    Ok(())
}

/// List mirrored workspaces.
///
/// # Errors
///
/// Returns an error if the database is missing or the query fails.
pub fn workspaces(
    document_id: Option<&str>,
    page: PageArgs,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let rows = storage.list_workspaces(document_id, page.limit, page.offset)?;

    if crate::is_csv() {
        println!("workspace_id,document_id,name,is_main");
        for w in &rows {
            println!(
                "{},{},{},{}",
                w.workspace_id,
                w.document_id,
                crate::csv_escape(&w.name),
                w.is_main
            );
        }
    } else if json {
        print_json_list(&rows)?;
    } else if rows.is_empty() {
        println!("No workspaces found.");
    } else {
        println!("Workspaces ({} shown):", rows.len());
        for w in &rows {
            let main = if w.is_main { " (main)" } else { "" };
            println!("  {}  {}{main}  doc {}", w.workspace_id, w.name, w.document_id);
        }
    }
    Ok(())
}

/// List mirrored elements.
///
/// # Errors
///
/// Returns an error if the database is missing or the query fails.
pub fn elements(
    document_id: Option<&str>,
    workspace_id: Option<&str>,
    element_type: Option<&str>,
    page: PageArgs,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let rows = storage.list_elements(
        document_id,
        workspace_id,
        element_type,
        page.limit,
        page.offset,
    )?;

    if crate::is_csv() {
        println!("element_id,document_id,workspace_id,name,element_type");
        for e in &rows {
            println!(
                "{},{},{},{},{}",
                e.element_id,
                e.document_id,
                e.workspace_id.as_deref().unwrap_or(""),
                crate::csv_escape(&e.name),
                e.element_type.as_deref().unwrap_or("")
            );
        }
    } else if json {
        print_json_list(&rows)?;
    } else if rows.is_empty() {
        println!("No elements found.");
    } else {
        println!("Elements ({} shown):", rows.len());
        for e in &rows {
            let mirrored = if is_part_studio(e.element_type.as_deref()) {
                "  (parts, features)"
            } else {
                ""
            };
            println!(
                "  {}  {:<12} {}{mirrored}",
                e.element_id,
                or_dash(e.element_type.as_deref()),
                e.name
            );
        }
    }
    Ok(())
}

/// List mirrored parts.
///
/// # Errors
///
/// Returns an error if the database is missing or the query fails.
pub fn parts(
    element_id: Option<&str>,
    page: PageArgs,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let rows = storage.list_parts(element_id, page.limit, page.offset)?;

    if crate::is_csv() {
        println!("part_id,element_id,name,body_type,has_mass_properties");
        for p in &rows {
            println!(
                "{},{},{},{},{}",
                p.part_id,
                p.element_id,
                crate::csv_escape(&p.name),
                p.body_type.as_deref().unwrap_or(""),
                p.mass_properties.is_some()
            );
        }
    } else if json {
        print_json_list(&rows)?;
    } else if rows.is_empty() {
        println!("No parts found.");
    } else {
        println!("Parts ({} shown):", rows.len());
        for p in &rows {
            let mass = if p.mass_properties.is_some() { "mass" } else { "-" };
            println!("  {}  {:<8} {:<4} {}", p.part_id, or_dash(p.body_type.as_deref()), mass, p.name);
        }
    }
    Ok(())
}

/// List mirrored features.
///
/// # Errors
///
/// Returns an error if the database is missing or the query fails.
pub fn features(
    element_id: Option<&str>,
    feature_type: Option<&str>,
    page: PageArgs,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let rows = storage.list_features(element_id, feature_type, page.limit, page.offset)?;

    if crate::is_csv() {
        println!("feature_id,element_id,name,feature_type,suppressed");
        for f in &rows {
            println!(
                "{},{},{},{},{}",
                f.feature_id,
                f.element_id,
                crate::csv_escape(&f.name),
                f.feature_type.as_deref().unwrap_or(""),
                f.suppressed
            );
        }
    } else if json {
        print_json_list(&rows)?;
    } else if rows.is_empty() {
        println!("No features found.");
    } else {
        println!("Features ({} shown):", rows.len());
        for f in &rows {
            let suppressed = if f.suppressed { " (suppressed)" } else { "" };
            println!(
                "  {}  {:<14} {}{suppressed}",
                f.feature_id,
                or_dash(f.feature_type.as_deref()),
                f.name
            );
        }
    }
    Ok(())
}

/// Show one record by external key.
///
/// # Errors
///
/// Returns `NotFound` if nothing is mirrored under `id`.
pub fn show(
    entity: Entity,
    id: &str,
    element_id: Option<&str>,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let not_found = |entity: &'static str| Error::NotFound {
        entity,
        id: id.to_string(),
    };

    match entity {
        Entity::Document => {
            let doc = storage.get_document(id)?.ok_or_else(|| not_found("Document"))?;
            emit(&doc, json, print_document)
        }
        Entity::Workspace => {
            let ws = storage.get_workspace(id)?.ok_or_else(|| not_found("Workspace"))?;
            emit(&ws, json, print_workspace)
        }
        Entity::Element => {
            let el = storage.get_element(id)?.ok_or_else(|| not_found("Element"))?;
            emit(&el, json, print_element)
        }
        Entity::Part => {
            let part = storage.get_part(id, element_id)?.ok_or_else(|| not_found("Part"))?;
            emit(&part, json, print_part)
        }
        Entity::Feature => {
            let feature = storage.get_feature(id, element_id)?.ok_or_else(|| not_found("Feature"))?;
            emit(&feature, json, print_feature)
        }
    }
}

fn emit<T: Serialize>(record: &T, json: bool, human: fn(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        human(record);
    }
    Ok(())
}

fn print_timestamps(created_at: i64, updated_at: i64) {
    println!("  Created:     {}", format_millis(created_at));
    println!("  Updated:     {}", format_millis(updated_at));
}

fn print_json_field(label: &str, value: Option<&serde_json::Value>) {
    if let Some(value) = value {
        let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        println!("  {label}:");
        for line in rendered.lines() {
            println!("    {line}");
        }
    }
}

fn print_document(d: &Document) {
    println!("Document {}", d.document_id);
    println!("  Name:        {}", d.name);
    if let Some(desc) = &d.description {
        println!("  Description: {desc}");
    }
    println!(
        "  Owner:       {} ({})",
        or_dash(d.owner_name.as_deref()),
        or_dash(d.owner_id.as_deref())
    );
    println!("  Public:      {}", d.public);
    print_timestamps(d.created_at, d.updated_at);
}

fn print_workspace(w: &Workspace) {
    println!("Workspace {}", w.workspace_id);
    println!("  Document:    {}", w.document_id);
    println!("  Name:        {}", w.name);
    println!("  Main:        {}", w.is_main);
    if let Some(desc) = &w.description {
        println!("  Description: {desc}");
    }
    print_timestamps(w.created_at, w.updated_at);
}

fn print_element(e: &Element) {
    println!("Element {}", e.element_id);
    println!("  Document:    {}", e.document_id);
    println!("  Workspace:   {}", or_dash(e.workspace_id.as_deref()));
    println!("  Name:        {}", e.name);
    println!("  Type:        {}", or_dash(e.element_type.as_deref()));
    println!("  Data type:   {}", or_dash(e.data_type.as_deref()));
    print_timestamps(e.created_at, e.updated_at);
}

fn print_part(p: &Part) {
    println!("Part {}", p.part_id);
    println!("  Element:     {}", p.element_id);
    println!("  Name:        {}", p.name);
    println!("  State:       {}", or_dash(p.state.as_deref()));
    println!("  Body type:   {}", or_dash(p.body_type.as_deref()));
    print_json_field("Material", p.material_properties.as_ref());
    print_json_field("Mass properties", p.mass_properties.as_ref());
    print_json_field("Appearance", p.appearance.as_ref());
    print_timestamps(p.created_at, p.updated_at);
}

fn print_feature(f: &Feature) {
    println!("Feature {}", f.feature_id);
    println!("  Element:     {}", f.element_id);
    println!("  Name:        {}", f.name);
    println!("  Type:        {}", or_dash(f.feature_type.as_deref()));
    println!("  Suppressed:  {}", f.suppressed);
    print_json_field("Parameters", f.parameters.as_ref());
    print_timestamps(f.created_at, f.updated_at);
}
