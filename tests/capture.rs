//! End-to-end captures against the static host

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use domsnap::dom::{Document, NodeId};
use domsnap::platform::static_page::StaticPage;
use domsnap::platform::{ElementName, ScrollMetrics, VideoState};
use domsnap::rendering::dpi::{pixels_per_meter, read_png_phys};
use domsnap::{
    BrowserEngine, CaptureConfig, CaptureContext, Error, FilterNode, Host, NodeFilter, NodeHook, OutputType,
    ProgressHandler,
};
use image::{Rgba, RgbaImage};
use std::sync::{Arc, Mutex};

const CARD: &str = r#"<!doctype html>
<html><head><style>
  .star::before { content: "*"; color: red }
</style></head>
<body>
  <div id="card" style="width: 120px; height: 80px">
    <span class="star">one</span>
    <span class="star">two</span>
  </div>
  <div id="empty" style="width: 0px; height: 0px"></div>
</body></html>"#;

fn decode(data_url: &str) -> Vec<u8> {
    let (_, body) = data_url.split_once(',').expect("data URL");
    STANDARD.decode(body).expect("base64 body")
}

const NESTED: &str = r#"<div id="root" style="margin: 10px; color: red; width: 100px; height: 40px"><span class="child" style="color: black">a</span><span class="plain">b</span></div>"#;

async fn markup_of(page: &StaticPage, selector: &str, config: CaptureConfig) -> String {
    let node = page.select(selector).unwrap();
    domsnap::dom_to_foreign_object_svg(page, &node, config).await.unwrap()
}

/// Inline style of the first cloned element whose markup contains `marker`
fn style_after<'a>(markup: &'a str, marker: &str) -> &'a str {
    let rest = &markup[markup.find(marker).expect("marked element")..];
    let open = rest.find(r#"style=""#).expect("inline style") + r#"style=""#.len();
    let close = rest[open..].find('"').expect("closing quote");
    &rest[open..open + close]
}

fn declarations(style: &str) -> Vec<(&str, &str)> {
    style.split(';').filter_map(|d| d.trim().split_once(": ")).collect()
}

/// `src` of every `<img>` in `markup`, in document order
fn image_sources(markup: &str) -> Vec<&str> {
    markup
        .split("<img")
        .skip(1)
        .filter_map(|tag| {
            let open = tag.find(r#" src=""#)? + r#" src=""#.len();
            let close = tag[open..].find('"')?;
            Some(&tag[open..open + close])
        })
        .collect()
}

#[tokio::test]
async fn png_covers_the_box_with_the_background() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let config = CaptureConfig {
        background_color: Some("#ff0000".to_string()),
        ..Default::default()
    };
    let data_url = domsnap::dom_to_png(&page, &card, config).await.unwrap();
    assert!(data_url.starts_with("data:image/png;base64,"));

    let image = image::load_from_memory(&decode(&data_url)).unwrap().to_rgba8();
    assert_eq!(image.dimensions(), (120, 80));
    assert_eq!(image.get_pixel(10, 10).0, [255, 0, 0, 255]);
}

#[tokio::test]
async fn scaled_png_carries_density() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let config = CaptureConfig {
        scale: 2.0,
        background_color: Some("white".to_string()),
        ..Default::default()
    };
    let data_url = domsnap::dom_to_png(&page, &card, config).await.unwrap();
    let bytes = decode(&data_url);

    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (240, 160));
    let ppm = pixels_per_meter(192.0);
    assert_eq!(read_png_phys(&bytes).unwrap(), Some((ppm, ppm, 1)));
}

#[tokio::test]
async fn unscaled_png_has_no_density_chunk() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let data_url = domsnap::dom_to_png(&page, &card, CaptureConfig::default()).await.unwrap();
    assert_eq!(read_png_phys(&decode(&data_url)).unwrap(), None);
}

#[tokio::test]
async fn jpeg_and_explicit_size() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let config = CaptureConfig {
        width: 50.0,
        height: 30.0,
        quality: 0.8,
        background_color: Some("#FFFFFF".to_string()),
        ..Default::default()
    };
    let data_url = domsnap::dom_to_jpeg(&page, &card, config).await.unwrap();
    assert!(data_url.starts_with("data:image/jpeg;base64,"));
    let image = image::load_from_memory(&decode(&data_url)).unwrap();
    assert_eq!((image.width(), image.height()), (50, 30));
}

#[tokio::test]
async fn zero_sized_element_gives_empty_data_url() {
    let page = StaticPage::parse(CARD, None);
    let empty = page.select("#empty").unwrap();
    let data_url = domsnap::dom_to_png(&page, &empty, CaptureConfig::default()).await.unwrap();
    assert_eq!(data_url, "data:,");
}

#[tokio::test]
async fn svg_output_is_a_percent_encoded_data_url() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let data_url = domsnap::dom_to_svg(&page, &card, CaptureConfig::default()).await.unwrap();
    assert!(data_url.starts_with("data:image/svg+xml;charset=utf-8,%3Csvg"));
    assert!(!data_url.contains('<'));
}

#[tokio::test]
async fn svg_holds_style_then_defs_then_foreign_object() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let markup = domsnap::dom_to_foreign_object_svg(&page, &card, CaptureConfig::default())
        .await
        .unwrap();

    assert!(markup.starts_with("<svg"));
    assert!(markup.contains(r#"viewBox="0 0 120 80""#));
    let style = markup.find("<style").unwrap();
    let defs = markup.find("<defs").unwrap();
    let foreign_object = markup.find("<foreignObject").unwrap();
    assert!(style < defs && defs < foreign_object);
    assert!(markup.contains(r#"width="100%""#));
}

#[tokio::test]
async fn identical_pseudo_elements_share_one_rule() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let markup = domsnap::dom_to_foreign_object_svg(&page, &card, CaptureConfig::default())
        .await
        .unwrap();

    assert_eq!(markup.matches("content: '*';").count(), 1);
    assert!(markup.contains("content: '*';\n  color: rgb(255, 0, 0);"));
    assert!(markup.contains(":before,\n."));
    assert!(markup.contains(".______background-clip--text {"));
}

#[tokio::test]
async fn scrolled_children_are_translated() {
    let mut page = StaticPage::parse(
        r#"<div id="list" style="width: 100px; height: 40px; overflow: auto"><p>a</p><p>b</p></div>"#,
        None,
    );
    let list = page.select("#list").unwrap();
    page.set_scroll(
        list,
        ScrollMetrics {
            scroll_top: 30.0,
            scroll_width: 100.0,
            scroll_height: 120.0,
            client_width: 100.0,
            client_height: 40.0,
            ..Default::default()
        },
    );

    let mut config = CaptureConfig::default();
    config.features.restore_scroll_position = true;
    let markup = domsnap::dom_to_foreign_object_svg(&page, &list, config.clone()).await.unwrap();
    assert_eq!(markup.matches("matrix(1, 0, 0, 1, 0, -30)").count(), 2);

    config.features.restore_scroll_position = false;
    let markup = domsnap::dom_to_foreign_object_svg(&page, &list, config).await.unwrap();
    assert!(!markup.contains("matrix("));
}

#[tokio::test]
async fn reused_context_renders_repeatedly() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let config = CaptureConfig {
        reuse_context: true,
        ..Default::default()
    };
    let mut context = CaptureContext::new(&page, card, config).await.unwrap();
    assert_eq!((context.width(), context.height()), (120.0, 80.0));

    let first = context.svg_markup().await.unwrap();
    let second = context.svg_markup().await.unwrap();
    assert_eq!(first.matches("content: '*';").count(), 1);
    assert_eq!(second.matches("content: '*';").count(), 1);
    assert!(context.render_as(OutputType::Png).await.unwrap().starts_with("data:image/png"));
    assert!(!context.is_destroyed());

    context.destroy();
    assert!(context.is_destroyed());
    assert!(context.render().await.is_err());
}

#[tokio::test]
async fn single_use_context_is_destroyed_after_render() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let mut context = CaptureContext::new(&page, card, CaptureConfig::default()).await.unwrap();
    context.render().await.unwrap();
    assert!(context.is_destroyed());
    assert!(context.render().await.is_err());
}

#[tokio::test]
async fn sandbox_failure_aborts_the_capture() {
    let mut page = StaticPage::parse(CARD, None);
    page.set_sandbox_failure("frames are blocked");
    let card = page.select("#card").unwrap();
    let result = domsnap::dom_to_png(&page, &card, CaptureConfig::default()).await;
    assert!(matches!(result, Err(Error::Sandbox(_))));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let page = StaticPage::parse(CARD, None);
    let card = page.select("#card").unwrap();
    let config = CaptureConfig {
        scale: -1.0,
        ..Default::default()
    };
    let result = domsnap::dom_to_png(&page, &card, config).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn children_restate_only_what_the_parent_changed() {
    let page = StaticPage::parse(NESTED, None);
    let markup = markup_of(&page, "#root", CaptureConfig::default()).await;

    let root = declarations(style_after(&markup, r#"id="root""#));
    let child = declarations(style_after(&markup, r#"class="child""#));
    let plain = declarations(style_after(&markup, r#"class="plain""#));
    assert!(child.contains(&("color", "rgb(0, 0, 0)")));
    assert!(child.contains(&("box-sizing", "content-box")));
    assert!(plain.contains(&("color", "rgb(255, 0, 0)")));

    let sandbox = page.create_sandbox().unwrap();
    let baseline = sandbox.default_style(&ElementName::html("span"), &[], None).unwrap();
    for (name, value) in child.iter().chain(plain.iter()) {
        if root.iter().any(|(n, _)| n == name) {
            continue;
        }
        assert_ne!(baseline.value(name), Some(*value), "{} kept at its default", name);
    }
}

#[tokio::test]
async fn root_drops_margins_and_uses_border_box() {
    let page = StaticPage::parse(NESTED, None);
    let markup = markup_of(&page, "#root", CaptureConfig::default()).await;
    let root = declarations(style_after(&markup, r#"id="root""#));
    assert!(root.contains(&("box-sizing", "border-box")));
    assert!(root.contains(&("color", "rgb(255, 0, 0)")));
    assert!(!root.iter().any(|(name, _)| name.starts_with("margin")));
}

#[tokio::test]
async fn canvases_become_images_even_when_tainted() {
    let mut page = StaticPage::parse(
        r#"<div id="art" style="width: 60px; height: 30px"><canvas id="clean" width="2" height="2"></canvas><canvas id="dirty" width="2" height="2"></canvas></div>"#,
        None,
    );
    let red = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]));
    let clean = page.select("#clean").unwrap();
    let dirty = page.select("#dirty").unwrap();
    page.set_canvas(clean, red.clone(), false);
    page.set_canvas(dirty, red, true);

    let markup = markup_of(&page, "#art", CaptureConfig::default()).await;
    assert!(!markup.contains("<canvas"));
    let sources = image_sources(&markup);
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0], sources[1]);
    assert!(sources[1].starts_with("data:image/png;base64,"));
    let pixels = image::load_from_memory(&decode(sources[1])).unwrap().to_rgba8();
    assert_eq!(pixels.get_pixel(1, 1).0, [255, 0, 0, 255]);
}

#[tokio::test]
async fn videos_render_as_frame_or_poster() {
    const FRAME: &str = "data:image/png;base64,ZnJhbWU=";
    const PLAYING_POSTER: &str = "data:image/png;base64,cG9zdGVyMQ==";
    const IDLE_POSTER: &str = "data:image/png;base64,cG9zdGVyMg==";
    const BROKEN_POSTER: &str = "data:image/png;base64,cG9zdGVyMw==";
    let mut page = StaticPage::parse(
        &format!(
            r#"<div id="player" style="width: 300px; height: 100px">
  <video id="playing" src="https://example.test/movie.mp4" poster="{}"></video>
  <video id="idle"></video>
  <video id="broken" src="https://example.test/broken.mp4" poster="{}"></video>
</div>"#,
            PLAYING_POSTER, BROKEN_POSTER
        ),
        None,
    );
    let playing = page.select("#playing").unwrap();
    let idle = page.select("#idle").unwrap();
    let broken = page.select("#broken").unwrap();
    page.set_video_frame(playing, FRAME);
    page.set_video(
        idle,
        VideoState {
            poster: Some(IDLE_POSTER.to_string()),
            ..Default::default()
        },
    );
    page.set_failed_media(broken, "decode error");

    let markup = markup_of(&page, "#player", CaptureConfig::default()).await;
    assert!(!markup.contains("<video"));
    assert_eq!(image_sources(&markup), vec![FRAME, IDLE_POSTER, BROKEN_POSTER]);
    assert!(!markup.contains(PLAYING_POSTER));
}

#[tokio::test]
async fn iframes_are_replaced_by_their_body() {
    let page = StaticPage::parse(
        r#"<div id="outer" style="width: 100px; height: 50px"><iframe srcdoc="<p id=inner>framed text</p>"></iframe></div>"#,
        None,
    );
    let markup = markup_of(&page, "#outer", CaptureConfig::default()).await;
    assert!(!markup.contains("<iframe"));
    assert!(markup.contains(r#"<p id="inner""#));
    assert!(markup.contains("framed text"));
}

#[tokio::test]
async fn filtered_nodes_are_left_out() {
    let page = StaticPage::parse(
        r#"<div id="list" style="width: 60px; height: 20px"><b>kept</b><i data-skip>dropped</i></div>"#,
        None,
    );
    let filter: NodeFilter = Arc::new(|node: &FilterNode<'_>| !node.has_attribute("data-skip"));
    let config = CaptureConfig {
        filter: Some(filter),
        ..Default::default()
    };
    let markup = markup_of(&page, "#list", config).await;
    assert!(markup.contains("kept"));
    assert!(!markup.contains("dropped"));
    assert!(!markup.contains("<i"));
}

#[tokio::test]
async fn hooks_see_the_clone_and_the_wrapper() {
    let page = StaticPage::parse(CARD, None);
    let mark = |attr: &'static str| -> NodeHook {
        Arc::new(move |doc: &mut Document, id: NodeId| {
            if let Some(el) = doc.element_mut(id) {
                el.set_attr(attr, "yes");
            }
        })
    };
    let config = CaptureConfig {
        on_clone_node: Some(mark("data-cloned")),
        on_embed_node: Some(mark("data-embedded")),
        on_create_foreign_object_svg: Some(mark("data-wrapped")),
        ..Default::default()
    };
    let markup = markup_of(&page, "#card", config).await;
    let svg_tag = &markup[..markup.find('>').unwrap()];
    assert!(svg_tag.starts_with("<svg"));
    assert!(svg_tag.contains(r#"data-wrapped="yes""#));
    let card = &markup[markup.find(r#"id="card""#).unwrap()..];
    let card_tag = &card[..card.find('>').unwrap()];
    assert!(card_tag.contains(r#"data-cloned="yes""#));
    assert!(card_tag.contains(r#"data-embedded="yes""#));
}

#[tokio::test]
async fn progress_reports_every_embed_task() {
    let mut page = StaticPage::parse(
        r#"<div id="pics" style="width: 40px; height: 20px"><img src="a.png"><img src="b.png"></div>"#,
        Some("https://example.test/index.html"),
    );
    page.add_resource("https://example.test/a.png", "image/png", b"a".to_vec());
    page.add_resource("https://example.test/b.png", "image/png", b"b".to_vec());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress: ProgressHandler = {
        let seen = seen.clone();
        Arc::new(move |done: usize, total: usize| seen.lock().unwrap().push((done, total)))
    };
    let config = CaptureConfig {
        progress: Some(progress),
        ..Default::default()
    };
    markup_of(&page, "#pics", config).await;

    let seen = seen.lock().unwrap();
    let total = seen[0].1;
    assert!(total >= 2);
    assert_eq!(seen[0], (0, total));
    assert_eq!(seen.last(), Some(&(total, total)));
    assert_eq!(seen.len(), total + 1);
}

#[tokio::test]
async fn blink_defaults_kerning_and_clips_unneeded_ellipsis() {
    const CLIPPED: &str = r#"<div id="clip" style="width: 80px; height: 20px; overflow: hidden; text-overflow: ellipsis">short</div>"#;
    let mut page = StaticPage::parse(CLIPPED, None);
    let markup = markup_of(&page, "#clip", CaptureConfig::default()).await;
    let other = declarations(style_after(&markup, r#"id="clip""#));
    assert!(other.contains(&("text-overflow", "ellipsis")));
    assert!(!other.contains(&("font-kerning", "normal")));

    page.set_engine(BrowserEngine::Blink);
    let markup = markup_of(&page, "#clip", CaptureConfig::default()).await;
    let blink = declarations(style_after(&markup, r#"id="clip""#));
    assert!(blink.contains(&("text-overflow", "clip")));
    assert!(blink.contains(&("font-kerning", "normal")));
}

#[tokio::test]
async fn live_form_values_are_copied() {
    let mut page = StaticPage::parse(
        r#"<form id="form" style="width: 100px; height: 30px"><input id="name" value="old"></form>"#,
        None,
    );
    let input = page.select("#name").unwrap();
    page.set_form_value(input, "typed");
    let markup = markup_of(&page, "#form", CaptureConfig::default()).await;
    assert!(markup.contains(r#"value="typed""#));
    assert!(!markup.contains(r#"value="old""#));
}

#[tokio::test]
async fn images_use_the_selected_source() {
    let mut page = StaticPage::parse(
        r#"<div id="pic" style="width: 40px; height: 40px"><img id="img" src="small.png" srcset="big.png 2x"></div>"#,
        Some("https://example.test/index.html"),
    );
    let img = page.select("#img").unwrap();
    page.set_current_src(img, "https://example.test/big.png");
    page.add_resource("https://example.test/big.png", "image/png", b"big".to_vec());

    let markup = markup_of(&page, "#pic", CaptureConfig::default()).await;
    assert!(markup.contains(r#"data-original-src="https://example.test/big.png""#));
    assert_eq!(image_sources(&markup), vec!["data:image/png;base64,Ymln"]);
    assert!(!markup.contains("small.png"));
    assert_eq!(page.request_count("https://example.test/small.png"), 0);
}

#[tokio::test]
async fn auto_width_blocks_follow_the_viewport() {
    let mut page = StaticPage::parse(r#"<html><body><p id="wide">text</p></body></html>"#, None);
    page.set_viewport(300.0, 200.0);
    let wide = page.select("#wide").unwrap();
    let context = CaptureContext::new(&page, wide, CaptureConfig::default()).await.unwrap();
    assert_eq!(context.width(), 284.0);
}
