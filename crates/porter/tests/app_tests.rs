//! End-to-end scenarios over a real project fixture.

mod helpers;

use helpers::{body, count, TestProject};
use porter::SourceMap;

fn components_fixture() -> TestProject {
    let project = TestProject::new();
    project.write(
        "package.json",
        r#"{ "name": "demo", "version": "1.0.0", "dependencies": { "yen": "1.2.4" } }"#,
    );
    project.write(
        "components/home.js",
        "var dep = require('./home_dep.js');\nvar yen = require('yen');\nmodule.exports = dep;\n",
    );
    project.write("components/home_dep.js", "module.exports = 'dep';\n");
    project.packet(
        "yen",
        "1.2.4",
        &[("index.js", "module.exports = function yen() {};\n")],
    );
    project
}

#[tokio::test]
async fn s1_components_entry_with_loader() {
    let project = components_fixture();
    let app = project.app().await;

    let text = body(&app, "home.js", true).await;
    assert!(text.contains("porter.define(\"home.js\""));
    assert!(text.contains("porter.define(\"home_dep.js\""));
    assert!(text.contains("porter.define(\"yen"));
    assert!(text.contains("Object.assign(porter.lock,"));
    assert!(text.trim_end().ends_with("porter.import(\"home.js\");"));
}

#[tokio::test]
async fn s2_concurrent_css_and_js() {
    let project = components_fixture();
    project.write(
        "components/stylesheets/app.css",
        "body { margin: 0; }\n",
    );
    let app = project.app().await;

    let (css, js) = tokio::join!(
        app.read_asset("stylesheets/app.css", false),
        app.read_asset("home.js", true),
    );
    let css = css.unwrap().expect("css resolves");
    let js = js.unwrap().expect("js resolves");

    assert_eq!(css.content_type, "text/css");
    let js_text = String::from_utf8(js.content).unwrap();
    assert!(js_text.contains("porter.define(\"home.js\""));
    assert!(js_text.contains("porter.define(\"home_dep.js\""));
}

#[tokio::test]
async fn s3_json_dependency_becomes_module() {
    let project = TestProject::new();
    project.write(
        "components/home.js",
        "var data = require('require-json/foo.json');\nmodule.exports = data;\n",
    );
    project.write("components/require-json/foo.json", "{\"foo\":1,\"bar\":true}");
    let app = project.app().await;

    let text = body(&app, "home.js", true).await;
    assert!(text.contains("porter.define(\"require-json/foo.json\""));
    assert!(text.contains("module.exports = {\"foo\":1,\"bar\":true};"));
}

#[tokio::test]
async fn s4_versioned_dependency_url() {
    let project = components_fixture();
    let app = project.app().await;

    let versioned = app.read_asset("yen/1.2.4/index.js", false).await.unwrap();
    assert!(versioned.is_some());
    let text = String::from_utf8(versioned.unwrap().content).unwrap();
    assert!(text.contains("porter.define(\"yen/1.2.4/index.js\""));

    let unversioned = app.read_asset("yen/index.js", false).await.unwrap();
    assert!(unversioned.is_none());
}

#[tokio::test]
async fn s5_sourcemap_sources_are_project_rooted() {
    let project = components_fixture();
    let app = project.app().await;

    let _ = body(&app, "home.js", true).await;
    let map_json = body(&app, "home.js.map", false).await;
    let map = SourceMap::from_json(&map_json).unwrap();

    assert_eq!(map.source_root.as_deref(), Some("/"));
    assert!(map.sources.iter().any(|s| s == "components/home.js"));
    assert!(map.sources.iter().any(|s| s == "components/home_dep.js"));
    assert!(map.sources.iter().any(|s| s == "loader.js"));
    assert!(map.sources_content.is_empty());
}

#[tokio::test]
async fn bundle_reproducibility_across_apps() {
    let project = components_fixture();

    let first = {
        let app = project.app().await;
        body(&app, "home.js", true).await
    };
    let second = {
        let app = project.app().await;
        body(&app, "home.js", true).await
    };
    assert_eq!(first, second);
}

#[tokio::test]
async fn etag_stable_until_mutation() {
    let project = components_fixture();
    let app = project.app().await;

    let first = app.read_asset("home.js", true).await.unwrap().unwrap();
    let second = app.read_asset("home.js", true).await.unwrap().unwrap();
    assert_eq!(first.etag, second.etag);

    project.write(
        "components/home_dep.js",
        "module.exports = 'changed';\n",
    );
    app.reload(porter::ReloadKind::Change, "components/home_dep.js")
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let third = app.read_asset("home.js", true).await.unwrap().unwrap();
    assert_ne!(first.etag, third.etag);
}

#[tokio::test]
async fn preload_exclusivity() {
    let project = TestProject::new();
    project.write(
        "components/preload.js",
        "require('./shared.js');\n",
    );
    project.write("components/shared.js", "module.exports = 'shared';\n");
    project.write(
        "components/home.js",
        "require('./shared.js');\nmodule.exports = 'home';\n",
    );
    project.write(
        "components/about.js",
        "require('./shared.js');\nmodule.exports = 'about';\n",
    );
    let app = project
        .app_with(|config| {
            config.preload = vec!["preload.js".to_string()];
            config.entries = vec!["home.js".to_string(), "about.js".to_string()];
        })
        .await;

    let home = body(&app, "home.js", true).await;
    let about = body(&app, "about.js", true).await;
    let preload = body(&app, "preload.js", false).await;

    assert!(!home.contains("porter.define(\"shared.js\""));
    assert!(!about.contains("porter.define(\"shared.js\""));
    assert_eq!(count(&preload, "porter.define(\"shared.js\""), 1);
}

#[tokio::test]
async fn isolated_packet_stays_out_of_root_bundles() {
    let project = TestProject::new();
    project.write(
        "package.json",
        r#"{ "name": "demo", "version": "1.0.0", "dependencies": { "react": "16.14.0" } }"#,
    );
    project.write(
        "components/home.js",
        "var react = require('react');\nmodule.exports = react;\n",
    );
    project.packet(
        "react",
        "16.14.0",
        &[("index.js", "module.exports = { createElement: function() {} };\n")],
    );
    let app = project
        .app_with(|config| {
            config.entries = vec!["home.js".to_string()];
            config.bundle.exclude = vec!["react".to_string()];
        })
        .await;

    let home = body(&app, "home.js", true).await;
    assert!(!home.contains("porter.define(\"react/"));

    // The excluded packet is delivered as its own artifact instead.
    let react = body(&app, "react/16.14.0/index.js", false).await;
    assert!(react.contains("porter.define(\"react/16.14.0/index.js\""));
}

#[tokio::test]
async fn two_versions_of_one_library_coexist() {
    let project = TestProject::new();
    project.write(
        "package.json",
        r#"{ "name": "demo", "version": "1.0.0", "dependencies": { "yen": "1.2.4", "legacy": "1.0.0" } }"#,
    );
    project.write(
        "components/home.js",
        "require('yen');\nrequire('legacy');\n",
    );
    project.packet("yen", "1.2.4", &[("index.js", "module.exports = 'new';\n")]);
    project.packet(
        "legacy",
        "1.0.0",
        &[("index.js", "require('yen');\nmodule.exports = 'legacy';\n")],
    );
    project.packet_at(
        "node_modules/legacy/node_modules/yen",
        "yen",
        "0.5.0",
        &[("index.js", "module.exports = 'old';\n")],
    );
    let app = project
        .app_with(|config| config.entries = vec!["home.js".to_string()])
        .await;

    let home = body(&app, "home.js", true).await;
    assert!(home.contains("porter.define(\"yen/1.2.4/index.js\""));
    assert!(home.contains("porter.define(\"yen/0.5.0/index.js\""));

    // The lock carries both versions for runtime dispatch.
    let lock = app.lock_json();
    assert!(lock["yen"].get("1.2.4").is_some());
    assert!(lock["yen"].get("0.5.0").is_some());
}

#[tokio::test]
async fn loader_config_descriptor() {
    let project = components_fixture();
    let app = project.app().await;
    let _ = body(&app, "home.js", true).await;

    let config = app.loader_config();
    assert_eq!(config["name"], "demo");
    assert_eq!(config["version"], "1.0.0");
    assert!(config["lock"]["yen"]["1.2.4"].is_object());
}

#[tokio::test]
async fn compile_all_writes_hashed_artifacts_and_manifest() {
    let project = components_fixture();
    let app = project.app().await;
    app.compile_all(true).await.unwrap();

    let dest = project.root().join("public");
    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dest.join("manifest.json")).unwrap())
            .unwrap();
    let output = manifest["home.js"].as_str().unwrap();
    assert!(output.starts_with("home."));
    assert!(output.ends_with(".js"));
    assert!(dest.join(output).exists());
    assert!(dest.join(format!("{output}.map")).exists());

    // Dependency artifacts live under name/version.
    let yen_dir = dest.join("yen/1.2.4");
    let artifacts: Vec<_> = std::fs::read_dir(&yen_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(artifacts.iter().any(|name| name.starts_with("index.") && name.ends_with(".js")));
}

#[tokio::test]
async fn css_companion_of_script_entry() {
    let project = TestProject::new();
    project.write(
        "components/home.js",
        "require('./home.css');\nmodule.exports = 'home';\n",
    );
    project.write("components/home.css", ".home { color: red; }\n");
    let app = project
        .app_with(|config| config.entries = vec!["home.js".to_string()])
        .await;

    let css = body(&app, "home.css", false).await;
    assert!(css.contains(".home { color: red; }"));

    // A script entry without any stylesheet in its graph renders empty.
    project.write("components/plain.js", "module.exports = 1;\n");
    let plain_css = app.read_asset("plain.css", false).await.unwrap().unwrap();
    assert!(plain_css.content.is_empty());
}

#[tokio::test]
async fn service_worker_and_raw_sources() {
    let project = components_fixture();
    let app = project
        .app_with(|config| {
            config.entries = vec!["home.js".to_string()];
            config.source.serve = true;
        })
        .await;

    let sw = body(&app, "porter-sw.js", false).await;
    assert!(sw.contains("addEventListener"));

    let raw = body(&app, "components/home.js", false).await;
    assert!(raw.contains("require('./home_dep.js')"));
    assert!(!raw.contains("porter.define"));
}
